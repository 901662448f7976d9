//! Seams for the external speech collaborators: speech synthesis, speech
//! recognition, and the object store for audio blobs. The providers behind
//! these traits live outside this service; the gateway only drives them and
//! records their telemetry.

use async_trait::async_trait;
use base64::Engine as _;
use memoir_protocol::ServerFrame;
use memoir_store::types::{AsrCallRecord, TtsCallRecord};
use memoir_store::Store;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Error)]
#[error("voice provider error: {0}")]
pub struct VoiceError(pub String);

/// Sentence in, audio bytes out. Implementations must be order-preserving
/// per call sequence; the pump below serializes calls to guarantee the
/// client hears sentences in flush order.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    async fn synthesize(&self, sentence: &str) -> Result<Vec<u8>, VoiceError>;
}

/// Audio bytes in, transcript out.
#[async_trait]
pub trait AsrEngine: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, VoiceError>;
}

/// PUT bytes under a key, get a public URL back.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, VoiceError>;
}

/// Consume flushed sentences, synthesize each in order, and push audio
/// frames to the client. Synthesis failures are logged and skipped — the
/// text stream is never interrupted by a broken voice.
///
/// Returns the concatenated audio for optional blob persistence.
pub async fn synthesize_stream(
    tts: Option<&dyn TtsEngine>,
    store: &Store,
    mut sentences: mpsc::Receiver<String>,
    frames: mpsc::Sender<ServerFrame>,
) -> Vec<u8> {
    let mut all_audio = Vec::new();
    while let Some(sentence) = sentences.recv().await {
        let Some(tts) = tts else {
            // No synthesizer configured: drain so the splitter never blocks.
            continue;
        };
        let started = std::time::Instant::now();
        match tts.synthesize(&sentence).await {
            Ok(audio) => {
                store.record_tts_call(&TtsCallRecord {
                    utterance_id: None,
                    voice_clip_id: None,
                    model_id: None,
                    duration_ms: started.elapsed().as_millis() as i64,
                    cost: 0.0,
                });
                let data = base64::engine::general_purpose::STANDARD.encode(&audio);
                all_audio.extend_from_slice(&audio);
                if frames.send(ServerFrame::Audio { data }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, chars = sentence.chars().count(), "sentence synthesis failed");
            }
        }
    }
    all_audio
}

/// Transcribe one audio clip and record the recognition call against the
/// utterance it produced. Wired up by deployments that feed client audio
/// through the gateway instead of transcribing on-device.
#[allow(dead_code)]
pub async fn transcribe_clip(
    asr: &dyn AsrEngine,
    store: &Store,
    audio: &[u8],
    utterance_id: Option<i64>,
) -> Result<String, VoiceError> {
    let started = std::time::Instant::now();
    let text = asr.transcribe(audio).await?;
    store.record_asr_call(&AsrCallRecord {
        utterance_id,
        model_id: None,
        duration_ms: started.elapsed().as_millis() as i64,
        cost: 0.0,
    });
    Ok(text)
}
