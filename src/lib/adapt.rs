//! Warmup adaptation for the sampler: dual-averaging step size control and a
//! diagonal mass matrix estimated over doubling windows.

/// Nesterov dual averaging of `ln(step_size)` towards a target acceptance statistic.
#[derive(Clone, Debug)]
pub struct DualAverage {
    target: f64,
    mu: f64,
    log_step: f64,
    log_step_bar: f64,
    h_bar: f64,
    count: u64,
}

impl DualAverage {
    const GAMMA: f64 = 0.05;
    const T0: f64 = 10.0;
    const KAPPA: f64 = 0.75;

    pub fn new(initial_step: f64, target: f64) -> Self {
        let mut dual = Self {
            target,
            mu: 0.0,
            log_step: 0.0,
            log_step_bar: 0.0,
            h_bar: 0.0,
            count: 0,
        };
        dual.restart(initial_step);
        dual
    }

    /// Forget the history and shrink towards ten times `step`.
    pub fn restart(&mut self, step: f64) {
        self.mu = (10.0 * step).ln();
        self.log_step = step.ln();
        self.log_step_bar = 0.0;
        self.h_bar = 0.0;
        self.count = 0;
    }

    pub fn update(&mut self, accept_stat: f64) {
        self.count += 1;
        let t = self.count as f64;
        let eta = 1.0 / (t + Self::T0);
        self.h_bar = (1.0 - eta) * self.h_bar + eta * (self.target - accept_stat);
        self.log_step = self.mu - t.sqrt() / Self::GAMMA * self.h_bar;
        let w = t.powf(-Self::KAPPA);
        self.log_step_bar = w * self.log_step + (1.0 - w) * self.log_step_bar;
    }

    /// Step size to use for the next warmup iteration.
    pub fn current_step(&self) -> f64 {
        self.log_step.exp()
    }

    /// Averaged step size, used once warmup is over.
    pub fn final_step(&self) -> f64 {
        if self.count == 0 {
            self.current_step()
        } else {
            self.log_step_bar.exp()
        }
    }
}

/// Welford accumulator of per-coordinate variances.
#[derive(Clone, Debug)]
pub struct RunningVariance {
    n: u64,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl RunningVariance {
    pub fn new(dim: usize) -> Self {
        Self {
            n: 0,
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
        }
    }

    pub fn add(&mut self, x: &[f64]) {
        self.n += 1;
        let n = self.n as f64;
        for ((mean, m2), &value) in self.mean.iter_mut().zip(self.m2.iter_mut()).zip(x) {
            let delta = value - *mean;
            *mean += delta / n;
            *m2 += delta * (value - *mean);
        }
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn reset(&mut self) {
        self.n = 0;
        self.mean.iter_mut().for_each(|m| *m = 0.0);
        self.m2.iter_mut().for_each(|m| *m = 0.0);
    }

    /// Sample variances shrunk towards `1e-3`, as used for the inverse mass matrix.
    pub fn regularized(&self) -> Vec<f64> {
        let n = self.n as f64;
        if self.n < 2 {
            return vec![1.0; self.m2.len()];
        }
        self.m2
            .iter()
            .map(|m2| {
                let var = m2 / (n - 1.0);
                (n / (n + 5.0)) * var + 1e-3 * (5.0 / (n + 5.0))
            })
            .collect()
    }
}

/// Split of the warmup phase into a fast initial buffer, slow windows of
/// doubling length that estimate the mass matrix, and a fast terminal buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct WarmupSchedule {
    tune: usize,
    init_buffer: usize,
    term_buffer: usize,
    window_ends: Vec<usize>,
}

impl WarmupSchedule {
    const INIT_BUFFER: usize = 75;
    const TERM_BUFFER: usize = 50;
    const BASE_WINDOW: usize = 25;

    pub fn new(tune: usize) -> Self {
        // Too short for any metric adaptation.
        if tune < 20 {
            return Self {
                tune,
                init_buffer: tune,
                term_buffer: 0,
                window_ends: Vec::new(),
            };
        }

        let (init_buffer, term_buffer, base_window) =
            if Self::INIT_BUFFER + Self::TERM_BUFFER + Self::BASE_WINDOW > tune {
                let init = (0.15 * tune as f64) as usize;
                let term = (0.1 * tune as f64) as usize;
                (init, term, tune - init - term)
            } else {
                (Self::INIT_BUFFER, Self::TERM_BUFFER, Self::BASE_WINDOW)
            };

        let last_end = tune - term_buffer;
        let mut window_ends = Vec::new();
        let mut start = init_buffer;
        let mut size = base_window;
        loop {
            let end = start + size;
            if end + 2 * size > last_end {
                window_ends.push(last_end);
                break;
            }
            window_ends.push(end);
            start = end;
            size *= 2;
        }

        Self {
            tune,
            init_buffer,
            term_buffer,
            window_ends,
        }
    }

    /// Whether the draw of warmup iteration `iter` feeds the variance estimate.
    pub fn in_metric_window(&self, iter: usize) -> bool {
        !self.window_ends.is_empty()
            && iter >= self.init_buffer
            && iter < self.tune - self.term_buffer
    }

    /// Whether iteration `iter` closes a slow window.
    pub fn ends_window(&self, iter: usize) -> bool {
        self.window_ends.contains(&(iter + 1))
    }

    pub fn window_ends(&self) -> &[usize] {
        &self.window_ends
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule_windows() {
        let schedule = WarmupSchedule::new(1000);
        assert_eq!(schedule.window_ends(), &[100, 150, 250, 450, 950]);
        assert!(!schedule.in_metric_window(74));
        assert!(schedule.in_metric_window(75));
        assert!(schedule.in_metric_window(949));
        assert!(!schedule.in_metric_window(950));
        assert!(schedule.ends_window(99));
        assert!(!schedule.ends_window(100));
    }

    #[test]
    fn test_short_schedule() {
        let schedule = WarmupSchedule::new(100);
        // 15 / 10 percent buffers with a single window in between
        assert_eq!(schedule.window_ends(), &[90]);
        assert!(schedule.in_metric_window(15));
        assert!(!schedule.in_metric_window(14));

        let tiny = WarmupSchedule::new(10);
        assert!(tiny.window_ends().is_empty());
        assert!((0..10).all(|i| !tiny.in_metric_window(i) && !tiny.ends_window(i)));
    }

    #[test]
    fn test_dual_average_hits_target() {
        // acceptance falls off with the step size, 0.9 is reached at ln(1/0.9)
        let mut dual = DualAverage::new(1.0, 0.9);
        for _ in 0..2000 {
            let accept = (-dual.current_step()).exp();
            dual.update(accept);
        }
        let accept = (-dual.final_step()).exp();
        assert!((accept - 0.9).abs() < 0.02, "acceptance {}", accept);
    }

    #[test]
    fn test_running_variance() {
        let mut var = RunningVariance::new(2);
        for x in [1.0, 2.0, 3.0, 4.0, 5.0] {
            var.add(&[x, 2.0 * x]);
        }
        assert_eq!(var.count(), 5);
        let reg = var.regularized();
        // sample variances are 2.5 and 10
        let shrink = |v: f64| (5.0 / 10.0) * v + 1e-3 * 0.5;
        assert!((reg[0] - shrink(2.5)).abs() < 1e-12);
        assert!((reg[1] - shrink(10.0)).abs() < 1e-12);

        var.reset();
        assert_eq!(var.count(), 0);
        assert_eq!(var.regularized(), vec![1.0, 1.0]);
    }
}
