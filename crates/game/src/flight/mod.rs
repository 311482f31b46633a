mod model;
mod state;

pub use model::{FlightConfig, FlightModel, Integrator};
pub use state::{EntityState, InputSample, normalize_angle};
