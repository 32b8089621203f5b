use nalgebra::{DMatrix, Matrix3x4, Vector4};
use std::collections::HashMap;

// --- データ構造 ---

/// ローカル座標系（カメラ）→ リファレンス座標系（リモートデバイス）のアフィン変換
///
/// 同次座標 [x, y, z, 1] に左から掛ける 3x4 行列。
/// セッション中に一度だけ推定され、以降は不変。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform {
    matrix: Matrix3x4<f64>,
}

impl AffineTransform {
    pub fn from_matrix(matrix: Matrix3x4<f64>) -> Self {
        Self { matrix }
    }

    /// 恒等変換 [I | 0]
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3x4::identity(),
        }
    }

    pub fn matrix(&self) -> &Matrix3x4<f64> {
        &self.matrix
    }

    /// 点をリファレンス座標系へ写す
    pub fn apply(&self, point: [f64; 3]) -> [f64; 3] {
        let p = Vector4::new(point[0], point[1], point[2], 1.0);
        let out = self.matrix * p;
        [out[0], out[1], out[2]]
    }
}

/// 同一IDを共有するローカル点・リファレンス点のペア
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub id: u32,
    pub local: [f64; 3],
    pub reference: [f64; 3],
}

/// フィット試行の結果
///
/// 見送り（MissingIds / TooFewCorrespondences）は次サイクルで再試行できる。
/// 棄却（Degenerate / ResidualTooLarge）は対応点集合が数値的に不正で、
/// 同じ入力では何度試しても失敗する。
#[derive(Debug, Clone, PartialEq)]
pub enum FitOutcome {
    /// リファレンス側のIDがローカル観測に揃っていない
    MissingIds(Vec<u32>),
    /// 対応点が最小数に満たない
    TooFewCorrespondences { have: usize, need: usize },
    /// 対応点が退化している（同一直線上など）
    Degenerate { rank: usize },
    /// フィット残差が閾値を超過
    ResidualTooLarge { residual: f64, limit: f64 },
    /// フィット成功
    Fitted {
        transform: AffineTransform,
        residual: f64,
    },
}

// --- 対応点マッチング ---

/// リファレンス点列とローカル観測から対応点集合を構築する
///
/// リファレンス側の全IDがローカル観測に存在する場合のみ成功。
/// 1つでも欠けていれば Err に欠落ID（昇順）を返し、このサイクルは見送り。
/// 成功時の対応点はID昇順で安定している。
pub fn match_correspondences(
    reference: &[(u32, [f64; 3])],
    local: &HashMap<u32, [f64; 3]>,
) -> Result<Vec<Correspondence>, Vec<u32>> {
    let mut missing: Vec<u32> = reference
        .iter()
        .filter(|(id, _)| !local.contains_key(id))
        .map(|(id, _)| *id)
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        missing.dedup();
        return Err(missing);
    }

    let mut pairs: Vec<Correspondence> = reference
        .iter()
        .map(|(id, ref_pos)| Correspondence {
            id: *id,
            local: local[id],
            reference: *ref_pos,
        })
        .collect();
    pairs.sort_unstable_by_key(|c| c.id);
    Ok(pairs)
}

// --- 最小二乗フィット ---

/// 特異値の相対カットオフ。最大特異値に対してこれ未満はゼロ扱い。
const SINGULAR_VALUE_CUTOFF: f64 = 1e-9;

/// 対応点集合からアフィン変換を最小二乗で推定する
///
/// A（ローカル同次座標 n×4）と B（リファレンス座標 n×3）を組み、
/// A・X ≈ B を SVD で解く。変換は X の転置（3×4）。
///
/// 退化検出:
/// - rank(A) < 3（同一直線上の点など）は解が不定になるため棄却
/// - 最大点残差が max_residual を超えるフィットは棄却
///
/// n = 3 のとき系は劣決定だが、最小ノルム解は3つの対応点を正確に写す。
pub fn solve_transform(
    correspondences: &[Correspondence],
    min_correspondences: usize,
    max_residual: f64,
) -> FitOutcome {
    let n = correspondences.len();
    let need = min_correspondences.max(3);
    if n < need {
        return FitOutcome::TooFewCorrespondences { have: n, need };
    }

    let mut a = DMatrix::<f64>::zeros(n, 4);
    let mut b = DMatrix::<f64>::zeros(n, 3);
    for (i, c) in correspondences.iter().enumerate() {
        a[(i, 0)] = c.local[0];
        a[(i, 1)] = c.local[1];
        a[(i, 2)] = c.local[2];
        a[(i, 3)] = 1.0;
        b[(i, 0)] = c.reference[0];
        b[(i, 1)] = c.reference[1];
        b[(i, 2)] = c.reference[2];
    }

    let svd = a.clone().svd(true, true);
    let max_sv = svd
        .singular_values
        .iter()
        .fold(0.0f64, |acc, s| acc.max(*s));
    let eps = max_sv * SINGULAR_VALUE_CUTOFF;
    let rank = svd.rank(eps);
    if rank < 3 {
        return FitOutcome::Degenerate { rank };
    }

    let x = match svd.solve(&b, eps) {
        Ok(x) => x,
        // U/V は計算済みなのでここには到達しないが、念のため退化扱い
        Err(_) => return FitOutcome::Degenerate { rank },
    };

    // 最大点残差（ユークリッド距離）でフィット品質を判定
    let fitted = &a * &x;
    let mut residual = 0.0f64;
    for i in 0..n {
        let dx = fitted[(i, 0)] - b[(i, 0)];
        let dy = fitted[(i, 1)] - b[(i, 1)];
        let dz = fitted[(i, 2)] - b[(i, 2)];
        residual = residual.max((dx * dx + dy * dy + dz * dz).sqrt());
    }
    if residual > max_residual {
        return FitOutcome::ResidualTooLarge {
            residual,
            limit: max_residual,
        };
    }

    let transform = AffineTransform::from_matrix(Matrix3x4::from_fn(|r, c| x[(c, r)]));
    FitOutcome::Fitted {
        transform,
        residual,
    }
}
