/// Loss-scale policy for mixed-precision training.
///
/// The scale factor is handed to the model strategy through the step
/// context; the strategy multiplies the loss before backpropagation and
/// unscales gradients before applying them. After each step the executor
/// reports whether scaled gradients overflowed, and the policy grows or
/// backs off the scale accordingly.
///
/// The scale is intentionally not part of the checkpoint record: it
/// re-stabilizes within a few hundred steps after resume.
#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: usize,
    pub min_scale: f64,
    pub max_scale: f64,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f64.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f64.powi(24),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LossScaler {
    state: ScalerState,
}

#[derive(Debug, Clone)]
enum ScalerState {
    Disabled,
    Enabled(EnabledState),
}

#[derive(Debug, Clone)]
struct EnabledState {
    loss_scale: f64,
    stable_steps: usize,
    config: LossScaleConfig,
}

impl LossScaler {
    pub fn new(mixed_precision: bool) -> Self {
        Self::with_config(LossScaleConfig::default(), mixed_precision)
    }

    pub fn with_config(config: LossScaleConfig, mixed_precision: bool) -> Self {
        if !mixed_precision {
            return Self {
                state: ScalerState::Disabled,
            };
        }

        let cfg = sanitize_config(config);
        let state = EnabledState {
            loss_scale: cfg.initial_scale,
            stable_steps: 0,
            config: cfg,
        };
        Self {
            state: ScalerState::Enabled(state),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, ScalerState::Enabled(_))
    }

    pub fn loss_scale(&self) -> f64 {
        match &self.state {
            ScalerState::Disabled => 1.0,
            ScalerState::Enabled(state) => state.loss_scale,
        }
    }

    pub fn update(&mut self, found_inf: bool) {
        if let ScalerState::Enabled(state) = &mut self.state {
            if found_inf {
                state.loss_scale =
                    (state.loss_scale * state.config.backoff_factor).max(state.config.min_scale);
                state.stable_steps = 0;
            } else {
                state.stable_steps += 1;
                if state.stable_steps >= state.config.growth_interval {
                    state.loss_scale =
                        (state.loss_scale * state.config.growth_factor).min(state.config.max_scale);
                    state.stable_steps = 0;
                }
            }
        }
    }
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_after_interval() {
        let mut scaler = LossScaler::with_config(
            LossScaleConfig {
                initial_scale: 512.0,
                growth_interval: 2,
                ..LossScaleConfig::default()
            },
            true,
        );

        assert!(scaler.is_enabled());
        assert_eq!(scaler.loss_scale(), 512.0);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 512.0);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 1024.0);
    }

    #[test]
    fn backs_off_on_overflow() {
        let mut scaler = LossScaler::with_config(
            LossScaleConfig {
                initial_scale: 1024.0,
                backoff_factor: 0.25,
                ..LossScaleConfig::default()
            },
            true,
        );

        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 256.0);
    }

    #[test]
    fn overflow_resets_growth_progress() {
        let mut scaler = LossScaler::with_config(
            LossScaleConfig {
                initial_scale: 512.0,
                growth_interval: 2,
                ..LossScaleConfig::default()
            },
            true,
        );

        scaler.update(false);
        scaler.update(true);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 256.0);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 512.0);
    }

    #[test]
    fn never_shrinks_below_min_scale() {
        let mut scaler = LossScaler::with_config(
            LossScaleConfig {
                initial_scale: 2.0,
                min_scale: 1.0,
                ..LossScaleConfig::default()
            },
            true,
        );

        scaler.update(true);
        scaler.update(true);
        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 1.0);
    }

    #[test]
    fn no_op_when_full_precision() {
        let mut scaler = LossScaler::new(false);
        assert!(!scaler.is_enabled());
        assert_eq!(scaler.loss_scale(), 1.0);
        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 1.0);
    }
}
