use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

/// 正規化に失敗したとみなすベクトル長の下限
const MIN_EDGE_NORM: f64 = 1e-9;

/// マーカー4隅の3D座標から回転クォータニオン (x, y, z, w) を導出する
///
/// corners の並びは検出順（左上、右上、右下、左下）。
/// 辺ベクトル 0→1 をX軸、0→3 をY軸候補とし、外積でZ軸を立てたあと
/// Y軸を再直交化する（Gram–Schmidt）。深度ノイズで辺が直交からずれても
/// 正規直交系が得られる。
///
/// 退化したコーナー（辺長ゼロ、同一直線上）は None。
///
/// この回転はキャリブレーション変換とは独立で、変換は位置のみに適用される。
pub fn rotation_from_corners(corners: &[[f64; 3]; 4]) -> Option<[f64; 4]> {
    let c0 = Vector3::from(corners[0]);
    let c1 = Vector3::from(corners[1]);
    let c3 = Vector3::from(corners[3]);

    let x_axis = (c1 - c0).try_normalize(MIN_EDGE_NORM)?;
    let y_raw = (c3 - c0).try_normalize(MIN_EDGE_NORM)?;

    // 辺が平行なら外積が潰れる → 退化
    let z_axis = x_axis.cross(&y_raw).try_normalize(MIN_EDGE_NORM)?;
    let y_axis = z_axis.cross(&x_axis);

    let matrix = Matrix3::from_columns(&[x_axis, y_axis, z_axis]);
    let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(matrix));
    Some([q.i, q.j, q.k, q.w])
}
