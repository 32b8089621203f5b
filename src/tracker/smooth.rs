use std::collections::{HashMap, HashSet, VecDeque};

use crate::config::SmoothingConfig;

/// マーカーごとの移動平均フィルタ
///
/// IDごとに直近の生位置を固定長FIFOに保持し、算術平均を平滑化出力とする。
/// 指数平滑ではなく単純移動平均: 遅延はウィンドウ長に比例するが挙動が予測しやすい。
pub struct WindowSmoother {
    window_size: usize,
    history: HashMap<u32, VecDeque<[f64; 3]>>,
}

impl WindowSmoother {
    pub fn new(window_size: usize) -> Self {
        Self {
            // 0 は平滑化なしと同義なので1にクランプ
            window_size: window_size.max(1),
            history: HashMap::new(),
        }
    }

    pub fn from_config(config: &SmoothingConfig) -> Self {
        Self::new(config.window_size)
    }

    /// 新しい生位置を履歴に積み、ウィンドウ平均を返す
    pub fn smooth(&mut self, id: u32, position: [f64; 3]) -> [f64; 3] {
        let queue = self.history.entry(id).or_default();
        if queue.len() == self.window_size {
            queue.pop_front();
        }
        queue.push_back(position);

        let n = queue.len() as f64;
        let mut sum = [0.0f64; 3];
        for p in queue.iter() {
            sum[0] += p[0];
            sum[1] += p[1];
            sum[2] += p[2];
        }
        [sum[0] / n, sum[1] / n, sum[2] / n]
    }

    /// 今サイクル見えなかったIDの履歴を整理する
    ///
    /// 未観測IDは最古サンプルを1つ排出し、空になったらエントリを破棄する。
    /// ウィンドウ長サイクル連続で見えなければ履歴は完全に消え、
    /// 再出現したマーカーは古い位置を引きずらずに始まる。
    pub fn prune(&mut self, visible: &HashSet<u32>) {
        for (id, queue) in self.history.iter_mut() {
            if !visible.contains(id) {
                queue.pop_front();
            }
        }
        self.history.retain(|_, queue| !queue.is_empty());
    }

    /// 履歴を持つID数
    pub fn tracked_count(&self) -> usize {
        self.history.len()
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}
