pub mod acoustid;
pub mod audd;
pub mod event_bus;
pub mod features;
pub mod local_matcher;
pub mod play_tracker;
pub mod recognizer;
pub mod scheduler;
pub mod segmenter;
pub mod stats_recorder;
pub mod stream_puller;
pub mod supervisor;
pub mod track_registry;

pub use event_bus::EventBus;
pub use local_matcher::LocalMatcher;
pub use recognizer::Recognizer;
pub use scheduler::Scheduler;
pub use stats_recorder::StatsRecorder;
pub use supervisor::{PipelineContext, StationSupervisor};
pub use track_registry::TrackRegistry;
