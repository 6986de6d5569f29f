pub mod loader;
pub mod models;
pub mod validation;

pub use loader::load_from_env;
pub use models::{DEFAULT_NAMESPACE, GatewayConfig};
pub use validation::{GatewayConfigValidator, ValidationError, ValidationResult};
