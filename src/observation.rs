use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// 1フレーム分のマーカー観測（ローカル座標系）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedPoint {
    pub id: u32,
    /// 位置 (x, y, z) メートル
    pub position: [f64; 3],
    /// 回転 (クォータニオン: x, y, z, w)。コーナーが取れたマーカーのみ
    pub rotation: Option<[f64; 4]>,
}

/// ID → 最新観測のマップ。プロデューサが毎フレーム丸ごと置き換える
pub type ObservationSet = HashMap<u32, TrackedPoint>;

/// 最新観測スロット
///
/// 検出フィードタスクが publish で内容を丸ごと差し替え、
/// 交換ループが snapshot でコピーを取る。マージはしないので
/// 半更新状態が観測されることはない。
///
/// バックプレッシャなし: コンシューマが遅ければ古い観測は上書きされ、
/// プロデューサが遅ければ同じスナップショットが再利用される。
pub struct ObservationSlot {
    latest: Mutex<ObservationSet>,
    generation: AtomicU64,
}

impl ObservationSlot {
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(ObservationSet::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// 観測セットを丸ごと置き換える
    pub fn publish(&self, observations: ObservationSet) {
        let mut guard = self.latest.lock().unwrap();
        *guard = observations;
        drop(guard);
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// 現在の観測セットのコピーを取得する
    pub fn snapshot(&self) -> ObservationSet {
        self.latest.lock().unwrap().clone()
    }

    /// publish ごとにインクリメントされる世代カウンタ
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl Default for ObservationSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: u32, x: f64) -> TrackedPoint {
        TrackedPoint {
            id,
            position: [x, 0.0, 0.0],
            rotation: None,
        }
    }

    fn set_of(points: &[TrackedPoint]) -> ObservationSet {
        points.iter().map(|p| (p.id, *p)).collect()
    }

    #[test]
    fn test_publish_replaces_wholesale() {
        let slot = ObservationSlot::new();
        slot.publish(set_of(&[point(1, 1.0), point(2, 2.0)]));
        slot.publish(set_of(&[point(3, 3.0)]));

        let snap = slot.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(!snap.contains_key(&1), "old ids must not survive a publish");
        assert!(snap.contains_key(&3));
    }

    #[test]
    fn test_snapshot_is_isolated() {
        let slot = ObservationSlot::new();
        slot.publish(set_of(&[point(1, 1.0)]));
        let snap = slot.snapshot();
        slot.publish(set_of(&[point(1, 99.0)]));

        assert_eq!(snap[&1].position[0], 1.0, "snapshot must not see later publishes");
        assert_eq!(slot.snapshot()[&1].position[0], 99.0);
    }

    #[test]
    fn test_generation_increments() {
        let slot = ObservationSlot::new();
        assert_eq!(slot.generation(), 0);
        slot.publish(ObservationSet::new());
        slot.publish(ObservationSet::new());
        assert_eq!(slot.generation(), 2);
    }

    #[test]
    fn test_empty_slot_snapshot() {
        let slot = ObservationSlot::new();
        assert!(slot.snapshot().is_empty());
    }
}
