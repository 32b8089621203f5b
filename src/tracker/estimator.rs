use std::collections::{HashMap, HashSet};

use crate::calibration::{self, AffineTransform, FitOutcome};
use crate::config::{CalibrationConfig, SmoothingConfig};
use crate::observation::ObservationSet;
use crate::protocol::{Quat, TransformedAnchor, Vec3};
use crate::tracker::smooth::WindowSmoother;

/// セッション状態。TRACKINGは終端で、再キャリブレーションはしない
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorState {
    Calibrating,
    Tracking,
}

/// 1サイクルの処理結果
#[derive(Debug)]
pub enum CycleOutput {
    /// キャリブレーション未完了。outcome は今サイクルの試行が見送り/棄却された理由
    Calibrating(FitOutcome),
    /// このサイクルでフィット成立。anchors はキャリブレーション対応点のエコー
    /// （original = ローカル点、transformed = リファレンス点そのもの）
    Calibrated {
        residual: f64,
        anchors: Vec<TransformedAnchor>,
    },
    /// トラッキング中。現在可視の全マーカーを変換した集合（可視ゼロなら空）
    Tracked(Vec<TransformedAnchor>),
}

/// キャリブレーション・トラッキング推定器
///
/// CALIBRATING: サイクルごとにリファレンス点とローカル観測の対応を取り、
/// 揃い次第アフィン変換を一度だけ推定する。対応点はリファレンス側の全IDが
/// 同一サイクルに揃った場合のみ採用（サイクルをまたぐ部分蓄積はしない）。
///
/// TRACKING: 可視マーカーを平滑化→固定変換で写して返す。回転は変換せず
/// そのまま通す。
pub struct Estimator {
    transform: Option<AffineTransform>,
    smoother: WindowSmoother,
    smoothing_enabled: bool,
    min_correspondences: usize,
    max_residual: f64,
}

impl Estimator {
    pub fn from_config(calibration: &CalibrationConfig, smoothing: &SmoothingConfig) -> Self {
        Self {
            transform: None,
            smoother: WindowSmoother::from_config(smoothing),
            smoothing_enabled: smoothing.enabled,
            min_correspondences: calibration.min_correspondences,
            max_residual: calibration.max_residual,
        }
    }

    pub fn state(&self) -> EstimatorState {
        if self.transform.is_some() {
            EstimatorState::Tracking
        } else {
            EstimatorState::Calibrating
        }
    }

    pub fn transform(&self) -> Option<&AffineTransform> {
        self.transform.as_ref()
    }

    /// 平滑化履歴を持つマーカー数（状態ダンプ用）
    pub fn smoothed_marker_count(&self) -> usize {
        self.smoother.tracked_count()
    }

    /// 1サイクル分を処理する
    ///
    /// reference はこのサイクルに受信したリファレンス点列、observations は
    /// 観測スロットのスナップショット。TRACKING中は reference を使わない
    /// （変換はセッション中不変）。
    pub fn process_cycle(
        &mut self,
        reference: &[(u32, [f64; 3])],
        observations: &ObservationSet,
    ) -> CycleOutput {
        match self.transform {
            None => self.calibration_cycle(reference, observations),
            Some(transform) => self.tracking_cycle(&transform, observations),
        }
    }

    fn calibration_cycle(
        &mut self,
        reference: &[(u32, [f64; 3])],
        observations: &ObservationSet,
    ) -> CycleOutput {
        let local: HashMap<u32, [f64; 3]> = observations
            .values()
            .map(|p| (p.id, p.position))
            .collect();

        let pairs = match calibration::match_correspondences(reference, &local) {
            Ok(pairs) => pairs,
            Err(missing) => return CycleOutput::Calibrating(FitOutcome::MissingIds(missing)),
        };

        match calibration::solve_transform(&pairs, self.min_correspondences, self.max_residual) {
            FitOutcome::Fitted {
                transform,
                residual,
            } => {
                self.transform = Some(transform);
                let anchors = pairs
                    .iter()
                    .map(|c| TransformedAnchor {
                        anchor_id: c.id,
                        original_position: Vec3::from_array(c.local),
                        transformed_position: Vec3::from_array(c.reference),
                        rotation: observations
                            .get(&c.id)
                            .and_then(|p| p.rotation)
                            .map(Quat::from_array),
                    })
                    .collect();
                CycleOutput::Calibrated { residual, anchors }
            }
            outcome => CycleOutput::Calibrating(outcome),
        }
    }

    fn tracking_cycle(
        &mut self,
        transform: &AffineTransform,
        observations: &ObservationSet,
    ) -> CycleOutput {
        let mut visible: Vec<u32> = observations.keys().copied().collect();
        visible.sort_unstable();

        let anchors = visible
            .iter()
            .map(|id| {
                let point = &observations[id];
                let position = if self.smoothing_enabled {
                    self.smoother.smooth(point.id, point.position)
                } else {
                    point.position
                };
                TransformedAnchor {
                    anchor_id: point.id,
                    original_position: Vec3::from_array(position),
                    transformed_position: Vec3::from_array(transform.apply(position)),
                    rotation: point.rotation.map(Quat::from_array),
                }
            })
            .collect();

        let visible_set: HashSet<u32> = visible.into_iter().collect();
        self.smoother.prune(&visible_set);

        CycleOutput::Tracked(anchors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::TrackedPoint;

    fn estimator() -> Estimator {
        Estimator::from_config(&CalibrationConfig::default(), &SmoothingConfig::default())
    }

    fn estimator_no_smoothing() -> Estimator {
        let smoothing = SmoothingConfig {
            enabled: false,
            ..SmoothingConfig::default()
        };
        Estimator::from_config(&CalibrationConfig::default(), &smoothing)
    }

    fn observations(points: &[(u32, [f64; 3])]) -> ObservationSet {
        points
            .iter()
            .map(|(id, position)| {
                (
                    *id,
                    TrackedPoint {
                        id: *id,
                        position: *position,
                        rotation: None,
                    },
                )
            })
            .collect()
    }

    /// 並進 (10, 10, 0) のキャリブレーション入力（ID 1..=3、非共線）
    fn translation_setup() -> (Vec<(u32, [f64; 3])>, ObservationSet) {
        let local = [
            (1u32, [0.0, 0.0, 0.0]),
            (2, [1.0, 0.0, 0.0]),
            (3, [0.0, 1.0, 0.0]),
        ];
        let reference: Vec<(u32, [f64; 3])> = local
            .iter()
            .map(|(id, p)| (*id, [p[0] + 10.0, p[1] + 10.0, p[2]]))
            .collect();
        (reference, observations(&local))
    }

    fn approx_eq_vec3(a: Vec3, b: [f64; 3], eps: f64) -> bool {
        (a.x - b[0]).abs() < eps && (a.y - b[1]).abs() < eps && (a.z - b[2]).abs() < eps
    }

    #[test]
    fn test_missing_id_defers_calibration() {
        let mut est = estimator();
        let reference = vec![
            (1u32, [0.0, 0.0, 0.0]),
            (2, [1.0, 0.0, 0.0]),
            (3, [0.0, 1.0, 0.0]),
        ];
        let obs = observations(&[(1, [0.0, 0.0, 0.0]), (2, [1.0, 0.0, 0.0])]);

        match est.process_cycle(&reference, &obs) {
            CycleOutput::Calibrating(FitOutcome::MissingIds(ids)) => assert_eq!(ids, vec![3]),
            other => panic!("expected MissingIds, got {:?}", other),
        }
        assert_eq!(est.state(), EstimatorState::Calibrating);
        assert!(est.transform().is_none());
    }

    #[test]
    fn test_fewer_than_three_stays_calibrating() {
        let mut est = estimator();
        let reference = vec![(1u32, [0.0, 0.0, 0.0]), (2, [1.0, 0.0, 0.0])];
        let obs = observations(&[(1, [0.0, 0.0, 0.0]), (2, [1.0, 0.0, 0.0])]);

        match est.process_cycle(&reference, &obs) {
            CycleOutput::Calibrating(FitOutcome::TooFewCorrespondences { have, need }) => {
                assert_eq!((have, need), (2, 3));
            }
            other => panic!("expected TooFewCorrespondences, got {:?}", other),
        }
        assert!(est.transform().is_none());
    }

    #[test]
    fn test_collinear_reference_stays_calibrating() {
        let mut est = estimator();
        let local = [
            (1u32, [0.0, 0.0, 0.0]),
            (2, [1.0, 0.0, 0.0]),
            (3, [2.0, 0.0, 0.0]),
        ];
        let reference: Vec<(u32, [f64; 3])> =
            local.iter().map(|(id, p)| (*id, *p)).collect();

        match est.process_cycle(&reference, &observations(&local)) {
            CycleOutput::Calibrating(FitOutcome::Degenerate { .. }) => {}
            other => panic!("expected Degenerate, got {:?}", other),
        }
        assert_eq!(est.state(), EstimatorState::Calibrating);
    }

    #[test]
    fn test_calibration_echoes_correspondences() {
        let mut est = estimator();
        let (reference, obs) = translation_setup();

        let anchors = match est.process_cycle(&reference, &obs) {
            CycleOutput::Calibrated { residual, anchors } => {
                assert!(residual < 1e-9, "residual = {}", residual);
                anchors
            }
            other => panic!("expected Calibrated, got {:?}", other),
        };
        assert_eq!(est.state(), EstimatorState::Tracking);

        assert_eq!(anchors.len(), 3);
        let ids: Vec<u32> = anchors.iter().map(|a| a.anchor_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        // エコーは original = ローカル点、transformed = リファレンス点
        assert!(approx_eq_vec3(anchors[0].original_position, [0.0, 0.0, 0.0], 1e-12));
        assert!(approx_eq_vec3(anchors[0].transformed_position, [10.0, 10.0, 0.0], 1e-12));
    }

    #[test]
    fn test_tracking_transforms_any_visible_id() {
        let mut est = estimator();
        let (reference, obs) = translation_setup();
        est.process_cycle(&reference, &obs);

        // キャリブレーションに使っていないID 5 も変換対象
        let obs = observations(&[(5, [5.0, 5.0, 0.0])]);
        let anchors = match est.process_cycle(&reference, &obs) {
            CycleOutput::Tracked(anchors) => anchors,
            other => panic!("expected Tracked, got {:?}", other),
        };
        assert_eq!(anchors.len(), 1);
        assert_eq!(anchors[0].anchor_id, 5);
        assert!(
            approx_eq_vec3(anchors[0].transformed_position, [15.0, 15.0, 0.0], 1e-6),
            "got {:?}",
            anchors[0].transformed_position
        );
    }

    #[test]
    fn test_tracking_empty_observations_emit_empty() {
        let mut est = estimator();
        let (reference, obs) = translation_setup();
        est.process_cycle(&reference, &obs);

        match est.process_cycle(&reference, &ObservationSet::new()) {
            CycleOutput::Tracked(anchors) => assert!(anchors.is_empty()),
            other => panic!("expected Tracked, got {:?}", other),
        }
    }

    #[test]
    fn test_tracking_output_sorted_by_id() {
        let mut est = estimator();
        let (reference, obs) = translation_setup();
        est.process_cycle(&reference, &obs);

        let obs = observations(&[
            (9, [0.0, 0.0, 0.0]),
            (1, [1.0, 0.0, 0.0]),
            (4, [2.0, 0.0, 0.0]),
        ]);
        match est.process_cycle(&reference, &obs) {
            CycleOutput::Tracked(anchors) => {
                let ids: Vec<u32> = anchors.iter().map(|a| a.anchor_id).collect();
                assert_eq!(ids, vec![1, 4, 9]);
            }
            other => panic!("expected Tracked, got {:?}", other),
        }
    }

    #[test]
    fn test_smoothing_applied_before_transform() {
        // 恒等キャリブレーション（4点・非共面）で平滑化の効果だけを観測する
        let mut est = estimator();
        let local = [
            (1u32, [0.0, 0.0, 0.0]),
            (2, [1.0, 0.0, 0.0]),
            (3, [0.0, 1.0, 0.0]),
            (4, [0.0, 0.0, 1.0]),
        ];
        let reference: Vec<(u32, [f64; 3])> =
            local.iter().map(|(id, p)| (*id, *p)).collect();
        est.process_cycle(&reference, &observations(&local));

        est.process_cycle(&reference, &observations(&[(9, [0.0, 0.0, 0.0])]));
        let anchors = match est.process_cycle(&reference, &observations(&[(9, [2.0, 0.0, 0.0])])) {
            CycleOutput::Tracked(anchors) => anchors,
            other => panic!("expected Tracked, got {:?}", other),
        };
        // ウィンドウ平均 (0 + 2) / 2 = 1 が original にも transformed にも現れる
        assert!(approx_eq_vec3(anchors[0].original_position, [1.0, 0.0, 0.0], 1e-9));
        assert!(approx_eq_vec3(anchors[0].transformed_position, [1.0, 0.0, 0.0], 1e-9));
    }

    #[test]
    fn test_smoothing_disabled_uses_raw_positions() {
        let mut est = estimator_no_smoothing();
        let (reference, obs) = translation_setup();
        est.process_cycle(&reference, &obs);

        est.process_cycle(&reference, &observations(&[(9, [0.0, 0.0, 0.0])]));
        let anchors = match est.process_cycle(&reference, &observations(&[(9, [2.0, 0.0, 0.0])])) {
            CycleOutput::Tracked(anchors) => anchors,
            other => panic!("expected Tracked, got {:?}", other),
        };
        assert!(approx_eq_vec3(anchors[0].original_position, [2.0, 0.0, 0.0], 1e-12));
    }

    #[test]
    fn test_rotation_passes_through_untransformed() {
        let mut est = estimator();
        let (reference, obs) = translation_setup();
        est.process_cycle(&reference, &obs);

        let rotation = [0.5, 0.5, 0.5, 0.5];
        let mut obs = ObservationSet::new();
        obs.insert(
            7,
            TrackedPoint {
                id: 7,
                position: [1.0, 1.0, 1.0],
                rotation: Some(rotation),
            },
        );
        match est.process_cycle(&reference, &obs) {
            CycleOutput::Tracked(anchors) => {
                // 並進変換がかかっても回転は生の値のまま
                assert_eq!(anchors[0].rotation.unwrap().to_array(), rotation);
            }
            other => panic!("expected Tracked, got {:?}", other),
        }
    }

    #[test]
    fn test_transform_immutable_after_fit() {
        let mut est = estimator();
        let (reference, obs) = translation_setup();
        est.process_cycle(&reference, &obs);
        let fitted = *est.transform().unwrap();

        // その後のリファレンス点列は無視される（セッション中は再フィットしない）
        let shifted: Vec<(u32, [f64; 3])> = reference
            .iter()
            .map(|(id, p)| (*id, [p[0] + 100.0, p[1], p[2]]))
            .collect();
        est.process_cycle(&shifted, &obs);

        assert_eq!(est.transform().unwrap(), &fitted);
        assert_eq!(est.state(), EstimatorState::Tracking);
    }

    #[test]
    fn test_unseen_marker_history_evicted() {
        let mut est = estimator();
        let (reference, obs) = translation_setup();
        est.process_cycle(&reference, &obs);

        est.process_cycle(&reference, &observations(&[(9, [1.0, 0.0, 0.0])]));
        assert_eq!(est.smoothed_marker_count(), 1);

        // ウィンドウ長サイクル見えなければ履歴が消える
        for _ in 0..SmoothingConfig::default().window_size {
            est.process_cycle(&reference, &ObservationSet::new());
        }
        assert_eq!(est.smoothed_marker_count(), 0);
    }
}
