pub mod events;
pub mod stations;

pub use events::event_routes;
pub use stations::{station_routes, AppState};
