pub mod diarize;
pub mod engine;
pub mod export;
pub mod normalize;
pub mod progress;
#[cfg(feature = "whisper")]
mod whisper;

pub use diarize::{DiarizeError, SpeakerDiarizer, SpeakerTurn, assign_speakers, best_turn, speaker_styles};
pub use engine::{
    EngineError, EngineOutput, EngineRequest, RawSpan, SpeechEngine, WhisperModel, sanitize_spans,
};
pub use export::{ExportFormat, render};
pub use normalize::{AudioNormalizer, NormalizeError, NormalizedAudio, WHISPER_SAMPLE_RATE};
pub use progress::{
    Phase, ProgressSink, ProgressTracker, ProgressUpdate, ProgressWriter, SinkError, Stage,
    WriterSummary, resume_floor,
};

#[cfg(feature = "whisper")]
pub use whisper::{WhisperEngine, download_model, is_model_downloaded};
