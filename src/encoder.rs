//! Frame sequence → response body.
//!
//! WAV needs its data length in the header, so WAV is always buffered, even for
//! `stream=true`. Raw PCM is either buffered or flushed frame by frame.

use crate::backends::BYTES_PER_SAMPLE;
use crate::engine::FrameStream;
use crate::error::{SpeechError, SpeechResult};
use crate::request::{ResponseFormat, SynthesisJob};
use axum::body::Bytes;
use futures_util::stream::{self, Stream};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;

/// Response body produced by [`encode`].
pub enum EncodedAudio {
    /// Complete payload; the length is known.
    Buffered { bytes: Vec<u8>, samples: usize },
    /// Raw PCM chunks produced as the model generates them.
    Streamed(FrameStream),
}

/// Encode `frames` in the job's response format.
pub async fn encode(frames: FrameStream, job: &SynthesisJob) -> SpeechResult<EncodedAudio> {
    if job.streams_incrementally() {
        return Ok(EncodedAudio::Streamed(frames));
    }
    match job.response_format {
        ResponseFormat::Pcm => {
            let bytes = collect_pcm(frames).await?;
            let samples = bytes.len() / BYTES_PER_SAMPLE;
            Ok(EncodedAudio::Buffered { bytes, samples })
        }
        ResponseFormat::Wav => {
            let (bytes, samples) = collect_wav(frames).await?;
            Ok(EncodedAudio::Buffered { bytes, samples })
        }
    }
}

/// Drain every frame into one little-endian s16 buffer.
pub async fn collect_pcm(mut frames: FrameStream) -> SpeechResult<Vec<u8>> {
    let mut pcm = Vec::new();
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        pcm.reserve(frame.len() * BYTES_PER_SAMPLE);
        for sample in &frame.samples {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
    }
    Ok(pcm)
}

/// Drain every frame into a mono 16-bit WAV file. Returns the file and the
/// number of samples in it.
pub async fn collect_wav(mut frames: FrameStream) -> SpeechResult<(Vec<u8>, usize)> {
    let mut cursor = Cursor::new(Vec::new());
    let mut samples = 0usize;
    {
        let mut writer = WavWriter::new(&mut cursor, wav_spec(frames.sample_rate()))
            .map_err(wav_error)?;
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            for &sample in &frame.samples {
                writer.write_sample(sample).map_err(wav_error)?;
            }
            samples += frame.len();
        }
        writer.finalize().map_err(wav_error)?;
    }
    Ok((cursor.into_inner(), samples))
}

/// Raw PCM body stream: one chunk per frame, no header.
///
/// A failure after the first chunk cannot change the status line any more, so it
/// ends the body with an I/O error and the transport aborts the response.
pub fn pcm_stream(frames: FrameStream) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    stream::unfold(Some(frames), |state| async move {
        let mut frames = state?;
        match frames.next().await {
            Some(Ok(frame)) => Some((Ok(Bytes::from(frame.to_le_bytes())), Some(frames))),
            Some(Err(e)) => Some((Err(std::io::Error::other(e.to_string())), None)),
            None => None,
        }
    })
}

/// Mono, 16-bit signed, model sample rate.
pub fn wav_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

fn wav_error(err: hound::Error) -> SpeechError {
    match err {
        hound::Error::IoError(e) => SpeechError::Io(e),
        other => SpeechError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::tone::ToneModel;
    use crate::backends::SpeechModel;
    use crate::engine::SynthesisEngine;
    use crate::request::normalize;
    use futures_util::StreamExt;
    use serde_json::json;

    fn engine() -> SynthesisEngine {
        SynthesisEngine::start(
            || Ok(Box::new(ToneModel::new(16000).with_frame_samples(256)) as Box<dyn SpeechModel>),
            4,
        )
        .unwrap()
    }

    fn frames(engine: &SynthesisEngine, text: &str) -> FrameStream {
        let job = normalize(&json!({ "input": text })).unwrap();
        engine.invoke(&job, None).unwrap()
    }

    /// Declared size of the `data` chunk and the offset where its payload starts.
    fn data_chunk(wav: &[u8]) -> (u32, usize) {
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        let mut pos = 12;
        while pos + 8 <= wav.len() {
            let id = &wav[pos..pos + 4];
            let size = u32::from_le_bytes(wav[pos + 4..pos + 8].try_into().unwrap());
            if id == b"data" {
                return (size, pos + 8);
            }
            pos += 8 + size as usize;
        }
        panic!("no data chunk");
    }

    #[tokio::test]
    async fn test_wav_header_matches_payload() {
        let engine = engine();
        let (wav, samples) = collect_wav(frames(&engine, "hello world")).await.unwrap();

        let (declared, header_len) = data_chunk(&wav);
        assert_eq!(declared as usize, wav.len() - header_len);
        assert_eq!(declared as usize, samples * BYTES_PER_SAMPLE);

        let riff_size = u32::from_le_bytes(wav[4..8].try_into().unwrap());
        assert_eq!(riff_size as usize, wav.len() - 8);

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec(), wav_spec(16000));
        assert_eq!(reader.len() as usize, samples);
    }

    #[tokio::test]
    async fn test_wav_payload_equals_pcm() {
        let engine = engine();
        let (wav, _) = collect_wav(frames(&engine, "same text")).await.unwrap();
        let pcm = collect_pcm(frames(&engine, "same text")).await.unwrap();

        let (_, header_len) = data_chunk(&wav);
        assert_eq!(&wav[header_len..], pcm.as_slice());
    }

    #[tokio::test]
    async fn test_streamed_pcm_equals_buffered() {
        let engine = engine();
        let buffered = collect_pcm(frames(&engine, "stream me")).await.unwrap();

        let chunks: Vec<Bytes> = pcm_stream(frames(&engine, "stream me"))
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert!(chunks.len() > 1);

        let streamed: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(streamed, buffered);
    }

    #[tokio::test]
    async fn test_encode_selects_container() {
        let engine = engine();
        let job = |format: &str, stream: bool| {
            normalize(&json!({"input": "a", "response_format": format, "stream": stream})).unwrap()
        };

        let wav = encode(frames(&engine, "a"), &job("wav", true)).await.unwrap();
        assert!(matches!(wav, EncodedAudio::Buffered { ref bytes, .. } if bytes.starts_with(b"RIFF")));

        let pcm = encode(frames(&engine, "a"), &job("pcm", false)).await.unwrap();
        assert!(matches!(pcm, EncodedAudio::Buffered { ref bytes, samples } if bytes.len() == samples * 2));

        let streamed = encode(frames(&engine, "a"), &job("pcm", true)).await.unwrap();
        assert!(matches!(streamed, EncodedAudio::Streamed(_)));
    }
}
