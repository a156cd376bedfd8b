pub mod detection;
pub mod station;
pub mod track;

pub use detection::{Detection, RecognitionMethod};
pub use station::{Station, StationStatus};
pub use track::{Artist, Fingerprint, Label, Track, TrackDescriptor};
