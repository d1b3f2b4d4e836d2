pub mod logging;
pub mod panic;

/// Top-level config for observability.
#[derive(Clone, Debug)]
pub struct O11yConfig {
    pub logging: logging::Config,
    pub install_panic_hook: bool,
}

impl Default for O11yConfig {
    fn default() -> Self {
        Self {
            logging: logging::Config::default(),
            install_panic_hook: true,
        }
    }
}

pub fn init_all(cfg: &O11yConfig) -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&cfg.logging)?;
    if cfg.install_panic_hook {
        panic::install_hook();
    }
    Ok(())
}
