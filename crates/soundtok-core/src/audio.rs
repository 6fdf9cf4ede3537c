//! Waveform container plus decode and resampling helpers for uploaded audio.

use std::io::Cursor;

use tracing::debug;

use crate::error::{Error, Result};

/// Mono PCM samples in `[-1, 1]` with their sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decode an encoded audio file (WAV, FLAC, MP3, OGG, ...) into a mono waveform.
    ///
    /// Anything symphonia cannot probe is retried as plain WAV.
    pub fn from_audio_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidAudio("Empty audio input".to_string()));
        }
        let decoded = match decode_with_symphonia(bytes) {
            Ok(waveform) => waveform,
            Err(symphonia_err) => decode_wav(bytes).map_err(|wav_err| {
                Error::InvalidAudio(format!(
                    "Failed to decode audio ({symphonia_err}); as WAV: {wav_err}"
                ))
            })?,
        };
        decoded.sanitized()
    }

    /// Decode a base64 payload, with or without a `data:` URI prefix.
    pub fn from_base64(data: &str) -> Result<Self> {
        let bytes = base64_decode(data)?;
        Self::from_audio_bytes(&bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Reject unusable decodes and clamp samples into `[-1, 1]`, zeroing NaNs.
    fn sanitized(mut self) -> Result<Self> {
        if self.sample_rate == 0 {
            return Err(Error::InvalidAudio("Decoded audio has no sample rate".to_string()));
        }
        if self.samples.is_empty() {
            return Err(Error::InvalidAudio("Decoded audio contains no samples".to_string()));
        }
        for sample in &mut self.samples {
            *sample = if sample.is_finite() { sample.clamp(-1.0, 1.0) } else { 0.0 };
        }
        Ok(self)
    }
}

pub fn base64_decode(data: &str) -> Result<Vec<u8>> {
    use base64::Engine;

    let payload = if data.starts_with("data:") {
        data.split_once(',').map(|(_, b64)| b64).unwrap_or(data)
    } else {
        data
    };

    let normalized: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(normalized.as_bytes())
        .map_err(|e| Error::InvalidAudio(format!("Base64 decode error: {e}")))
}

/// Linear-interpolation resampler. Returns the input unchanged when rates match.
pub fn resample_linear(audio: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if audio.is_empty() || src_rate == 0 || dst_rate == 0 || src_rate == dst_rate {
        return audio.to_vec();
    }

    let ratio = dst_rate as f64 / src_rate as f64;
    let out_len = ((audio.len() as f64) * ratio).round().max(1.0) as usize;
    let mut out = vec![0.0f32; out_len];

    for (idx, sample) in out.iter_mut().enumerate() {
        let src_pos = idx as f64 / ratio;
        let left = (src_pos.floor() as usize).min(audio.len() - 1);
        let right = (left + 1).min(audio.len() - 1);
        let frac = (src_pos - left as f64).clamp(0.0, 1.0) as f32;
        *sample = audio[left] * (1.0 - frac) + audio[right] * frac;
    }

    debug!(
        "Resampled {} -> {} samples ({} Hz -> {} Hz)",
        audio.len(),
        out.len(),
        src_rate,
        dst_rate
    );

    out
}

fn decode_with_symphonia(bytes: &[u8]) -> Result<Waveform> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::probe::Hint;
    use symphonia::default::{get_codecs, get_probe};

    let source = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
    let mut format = get_probe()
        .format(&Hint::new(), source, &Default::default(), &Default::default())
        .map_err(|e| Error::InvalidAudio(format!("Unknown container: {e}")))?
        .format;
    let track = format
        .default_track()
        .ok_or_else(|| Error::InvalidAudio("No audio track".to_string()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut decoder = get_codecs()
        .make(&track.codec_params, &Default::default())
        .map_err(|e| Error::InvalidAudio(format!("Unsupported codec: {e}")))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            // End of stream.
            Err(SymphoniaError::IoError(_)) => break,
            Err(err) => return Err(Error::InvalidAudio(format!("Unreadable audio: {err}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(err) => return Err(Error::InvalidAudio(format!("Undecodable audio: {err}"))),
        };
        let spec = *decoded.spec();
        if sample_rate == 0 {
            sample_rate = spec.rate;
        }
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        downmix_into(buffer.samples(), spec.channels.count(), &mut samples);
    }

    Ok(Waveform::new(samples, sample_rate))
}

fn decode_wav(bytes: &[u8]) -> Result<Waveform> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| Error::InvalidAudio(e.to_string()))?;
    let spec = reader.spec();

    let interleaved: std::result::Result<Vec<f32>, hound::Error> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect(),
        hound::SampleFormat::Int => {
            let full_scale = (1i64 << spec.bits_per_sample.saturating_sub(1).min(31)) as f32;
            reader
                .samples::<i32>()
                .map(|sample| sample.map(|v| v as f32 / full_scale))
                .collect()
        }
    };
    let interleaved =
        interleaved.map_err(|e| Error::InvalidAudio(format!("Corrupt WAV data: {e}")))?;

    let mut samples = Vec::with_capacity(interleaved.len());
    downmix_into(&interleaved, spec.channels as usize, &mut samples);
    Ok(Waveform::new(samples, spec.sample_rate))
}

fn downmix_into(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    out.extend(
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
    );
}

#[cfg(test)]
pub(crate) fn wav_bytes(samples: &[f32], sample_rate: u32, channels: u16) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut bytes = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec).expect("writer");
        for sample in samples {
            writer
                .write_sample((sample * 32767.0) as i16)
                .expect("write sample");
        }
        writer.finalize().expect("finalize");
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[test]
    fn base64_decode_accepts_data_uri_payload() {
        let payload = [1u8, 2, 3, 4, 5];
        let b64 = base64::engine::general_purpose::STANDARD.encode(payload);
        let uri = format!("data:audio/wav;base64,{b64}");
        let decoded = base64_decode(&uri).expect("data URI decode should succeed");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn base64_decode_rejects_garbage_as_invalid_audio() {
        let err = base64_decode("!!not base64!!").expect_err("should fail");
        assert!(matches!(err, Error::InvalidAudio(_)));
    }

    #[test]
    fn stereo_wav_is_downmixed() {
        let bytes = wav_bytes(&[0.25, 0.75, 0.5, -0.5], 16_000, 2);

        let waveform = Waveform::from_audio_bytes(&bytes).expect("decode WAV");
        assert_eq!(waveform.sample_rate, 16_000);
        assert_eq!(waveform.samples.len(), 2);
        assert!((waveform.samples[0] - 0.5).abs() < 0.02);
        assert!(waveform.samples[1].abs() < 0.02);
    }

    #[test]
    fn empty_and_corrupt_bytes_are_invalid_audio() {
        assert!(matches!(
            Waveform::from_audio_bytes(&[]),
            Err(Error::InvalidAudio(_))
        ));
        assert!(matches!(
            Waveform::from_audio_bytes(b"definitely not audio"),
            Err(Error::InvalidAudio(_))
        ));
    }

    #[test]
    fn float_wav_samples_are_clamped() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut bytes = Vec::new();
        {
            let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec).expect("writer");
            for sample in [0.5f32, 3.0, -7.0] {
                writer.write_sample(sample).expect("write sample");
            }
            writer.finalize().expect("finalize");
        }

        let waveform = Waveform::from_audio_bytes(&bytes).expect("decode float WAV");
        assert_eq!(waveform.sample_rate, 8_000);
        assert_eq!(waveform.samples, vec![0.5, 1.0, -1.0]);
    }

    #[test]
    fn resample_keeps_matching_rate_untouched() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&input, 16_000, 16_000), input);
    }

    #[test]
    fn resample_scales_length_by_rate_ratio() {
        let input = vec![0.0f32; 48_000];
        let out = resample_linear(&input, 48_000, 16_000);
        assert_eq!(out.len(), 16_000);

        let ramp: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let up = resample_linear(&ramp, 8_000, 16_000);
        assert_eq!(up.len(), 16);
        assert!((up[1] - 0.5).abs() < 1e-6);
        assert!((up[15] - 7.0).abs() < 1e-6);
    }
}
