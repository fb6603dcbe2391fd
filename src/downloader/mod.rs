pub mod assembler;
pub mod chunk;
pub mod filename;
pub mod manager;
pub mod progress;
pub mod resolver;
pub mod scheduler;
pub mod task;
pub mod worker;

pub use assembler::FileAssembler;
pub use chunk::{plan_split, Chunk, ChunkDescriptor, ChunkState, MIN_CHUNK_SIZE};
pub use manager::{DownloadManager, SpeedCallback};
pub use progress::{SpeedCalculator, SpeedCalculatorConfig};
pub use resolver::{ProtocolHandler, UrlResolver};
pub use scheduler::WorkerId;
pub use task::{DownloadResult, ProgressCallback, ProgressUpdate};
pub use worker::DownloadWorker;
