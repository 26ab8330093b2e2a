pub mod local;
pub mod stub;
pub mod traits;
pub mod types;

pub use local::LocalEngine;
pub use stub::StubEngine;
pub use traits::ModelEngine;
pub use types::EngineError;
