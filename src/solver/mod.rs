pub mod astap;
pub mod common;
pub mod nova;

use std::sync::Arc;

use crate::config::{Config, ProviderKind};
use astap::AstapSolver;
use common::{PlateSolver, SolverError};
use nova::AstrometryNetClient;

/// Build the provider selected in `config`
pub fn from_config(config: &Config) -> Result<Arc<dyn PlateSolver>, SolverError> {
    let key = |value: &Option<String>| value.clone().unwrap_or_default();
    let solver: Arc<dyn PlateSolver> = match config.provider {
        ProviderKind::Nova => Arc::new(AstrometryNetClient::nova(&key(&config.astrometry_api_key))?),
        ProviderKind::Local => Arc::new(AstrometryNetClient::new(
            &key(&config.local_astrometry_api_key),
            &key(&config.local_astrometry_url),
        )?),
        ProviderKind::Astap => {
            let solver = match &config.astap_cli {
                Some(path) => AstapSolver::with_cli_path(path),
                None => AstapSolver::new(),
            };
            Arc::new(solver.map_err(|e| SolverError::Config(e.to_string()))?)
        }
    };
    Ok(solver)
}
