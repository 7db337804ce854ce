//! Voice profiles: `<id>.wav|mp3` + `<id>.txt` pairs in a single directory.
//!
//! Nothing is cached. Every lookup re-reads the directory so profiles can be added
//! or removed while the server runs.

use crate::error::{SpeechError, SpeechResult, SynthesisCause};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// The voice name that selects the model's built-in timbre.
pub const DEFAULT_VOICE: &str = "default";

/// Audio extensions in lookup priority order.
const AUDIO_EXTENSIONS: [&str; 2] = ["wav", "mp3"];
const TRANSCRIPT_EXTENSION: &str = "txt";

/// A usable cloning profile: an audio sample and the text spoken in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceProfile {
    pub id: String,
    pub audio: PathBuf,
    pub transcript: PathBuf,
}

/// Prompt conditioning read from a profile right before generation.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptConditioning {
    pub audio: PathBuf,
    pub text: String,
}

impl VoiceProfile {
    /// Read the transcript and check the audio sample is still readable.
    pub fn load_prompt(&self) -> SpeechResult<PromptConditioning> {
        let unreadable = |reason: String| {
            SpeechError::SynthesisFailed(SynthesisCause::ProfileUnreadable {
                voice: self.id.clone(),
                reason,
            })
        };

        let text = fs::read_to_string(&self.transcript)
            .map_err(|e| unreadable(format!("{}: {e}", self.transcript.display())))?;

        if is_wav(&self.audio) {
            hound::WavReader::open(&self.audio)
                .map_err(|e| unreadable(format!("{}: {e}", self.audio.display())))?;
        } else {
            let meta = fs::metadata(&self.audio)
                .map_err(|e| unreadable(format!("{}: {e}", self.audio.display())))?;
            if meta.len() == 0 {
                return Err(unreadable(format!("{} is empty", self.audio.display())));
            }
        }

        Ok(PromptConditioning {
            audio: self.audio.clone(),
            text: text.trim().to_string(),
        })
    }
}

/// Resolves voice names against the voices directory.
#[derive(Debug, Clone)]
pub struct VoiceRegistry {
    voices_dir: PathBuf,
}

impl VoiceRegistry {
    pub fn new(voices_dir: impl Into<PathBuf>) -> Self {
        Self {
            voices_dir: voices_dir.into(),
        }
    }

    pub fn voices_dir(&self) -> &Path {
        &self.voices_dir
    }

    /// Resolve a voice name.
    ///
    /// `None`, `""` and `"default"` resolve to `Ok(None)` (no conditioning). A name
    /// with an audio file but no transcript is `ProfileIncomplete`, a name with no
    /// audio file at all is `ProfileNotFound`.
    pub fn resolve(&self, voice_id: Option<&str>) -> SpeechResult<Option<VoiceProfile>> {
        let voice_id = match voice_id {
            None => return Ok(None),
            Some(id) if id.is_empty() || id == DEFAULT_VOICE => return Ok(None),
            Some(id) => id,
        };

        let candidates = self.audio_files();

        // Exact case first, then a case-insensitive match if it is unambiguous.
        let audio = pick_by_priority(candidates.iter().filter(|(stem, _)| stem == voice_id))
            .or_else(|| {
                let folded: Vec<_> = candidates
                    .iter()
                    .filter(|(stem, _)| stem.eq_ignore_ascii_case(voice_id))
                    .collect();
                let mut stems: Vec<_> = folded.iter().map(|(stem, _)| stem.as_str()).collect();
                stems.dedup();
                if stems.len() == 1 {
                    pick_by_priority(folded.into_iter())
                } else {
                    None
                }
            });

        let Some((stem, audio)) = audio else {
            return Err(SpeechError::ProfileNotFound(voice_id.to_string()));
        };

        let transcript = audio.with_extension(TRANSCRIPT_EXTENSION);
        if !transcript.is_file() {
            return Err(SpeechError::ProfileIncomplete {
                voice: voice_id.to_string(),
                transcript,
            });
        }

        Ok(Some(VoiceProfile {
            id: stem,
            audio,
            transcript,
        }))
    }

    /// All complete profiles, sorted by id.
    ///
    /// Samples without a transcript are skipped. A missing directory yields an
    /// empty list.
    pub fn list_profiles(&self) -> Vec<VoiceProfile> {
        let candidates = self.audio_files();

        let mut profiles: Vec<VoiceProfile> = Vec::new();
        for (stem, audio) in candidates {
            if profiles.iter().any(|p| p.id == stem) {
                continue;
            }
            let transcript = audio.with_extension(TRANSCRIPT_EXTENSION);
            if transcript.is_file() {
                profiles.push(VoiceProfile {
                    id: stem,
                    audio,
                    transcript,
                });
            }
        }
        profiles
    }

    /// `(stem, path)` of every audio file, sorted by stem then extension priority.
    fn audio_files(&self) -> Vec<(String, PathBuf)> {
        let mut files = Vec::new();

        if let Ok(entries) = fs::read_dir(&self.voices_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                if extension_rank(&path).is_none() {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    files.push((stem.to_string(), path.clone()));
                }
            }
        }

        files.sort_by(|(a, pa), (b, pb)| {
            a.cmp(b)
                .then_with(|| extension_rank(pa).cmp(&extension_rank(pb)))
        });
        files
    }
}

/// The highest-priority audio file among candidates sharing a stem.
fn pick_by_priority<'a>(
    candidates: impl Iterator<Item = &'a (String, PathBuf)>,
) -> Option<(String, PathBuf)> {
    candidates
        .min_by_key(|(_, path)| extension_rank(path))
        .cloned()
}

fn extension_rank(path: &Path) -> Option<usize> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    AUDIO_EXTENSIONS.iter().position(|e| *e == ext)
}

fn is_wav(path: &Path) -> bool {
    extension_rank(path) == Some(0)
}
