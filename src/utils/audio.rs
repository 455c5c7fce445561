use anyhow::{anyhow, Context, Result};
use std::io::Cursor;
use std::path::Path;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Interleaved 16-bit PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmClip {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmClip {
    pub fn empty(sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
            channels,
        }
    }

    pub fn frames(&self) -> u64 {
        self.samples.len() as u64 / self.channels.max(1) as u64
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.frames() * 1000 / self.sample_rate as u64
    }

    pub fn same_format(&self, other: &PcmClip) -> bool {
        self.sample_rate == other.sample_rate && self.channels == other.channels
    }

    pub fn append(&mut self, other: &PcmClip) -> Result<()> {
        if !self.same_format(other) {
            return Err(anyhow!(
                "Format mismatch: {} Hz/{} ch vs {} Hz/{} ch",
                self.sample_rate,
                self.channels,
                other.sample_rate,
                other.channels
            ));
        }
        self.samples.extend_from_slice(&other.samples);
        Ok(())
    }

    /// Same audio in `sample_rate`/`channels`. The frame count is scaled by
    /// the rate ratio, so the duration is preserved.
    pub fn convert_to(&self, sample_rate: u32, channels: u16) -> Result<PcmClip> {
        if self.same_format(&PcmClip::empty(sample_rate, channels)) {
            return Ok(self.clone());
        }
        if self.sample_rate == 0 || sample_rate == 0 || channels == 0 {
            return Err(anyhow!("Cannot convert to or from a zero sample rate"));
        }

        let planar = remix(&deinterleave(&self.samples, self.channels), channels as usize);
        let input_frames = planar.first().map(Vec::len).unwrap_or(0);
        let target_frames = (input_frames as u64 * sample_rate as u64 / self.sample_rate as u64) as usize;

        let planar = if sample_rate == self.sample_rate || input_frames == 0 {
            planar
        } else {
            let mut resampler = FastFixedIn::<f32>::new(
                sample_rate as f64 / self.sample_rate as f64,
                1.0,
                PolynomialDegree::Septic,
                input_frames,
                channels as usize,
            )
            .map_err(|e| anyhow!("Failed to create resampler: {}", e))?;
            resampler
                .process(&planar, None)
                .map_err(|e| anyhow!("Resampling failed: {}", e))?
        };

        let mut samples = Vec::with_capacity(target_frames * channels as usize);
        for frame in 0..target_frames {
            for channel in &planar {
                let s = channel.get(frame).copied().unwrap_or(0.0);
                samples.push((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
            }
        }
        Ok(PcmClip {
            samples,
            sample_rate,
            channels,
        })
    }
}

fn deinterleave(samples: &[i16], channels: u16) -> Vec<Vec<f32>> {
    let channels = channels.max(1) as usize;
    let mut planar = vec![Vec::with_capacity(samples.len() / channels); channels];
    for frame in samples.chunks_exact(channels) {
        for (ch, s) in frame.iter().enumerate() {
            planar[ch].push(*s as f32 / i16::MAX as f32);
        }
    }
    planar
}

/// Down to mono averages every channel; otherwise output channel `i` takes
/// input channel `i % n`.
fn remix(planar: &[Vec<f32>], channels: usize) -> Vec<Vec<f32>> {
    if planar.len() == channels {
        return planar.to_vec();
    }
    if channels == 1 {
        let frames = planar.first().map(Vec::len).unwrap_or(0);
        let n = planar.len().max(1) as f32;
        let mono = (0..frames)
            .map(|f| planar.iter().map(|ch| ch[f]).sum::<f32>() / n)
            .collect();
        return vec![mono];
    }
    (0..channels).map(|i| planar[i % planar.len()].clone()).collect()
}

/// Decodes any container/codec symphonia knows (WAV, MP3, OGG, FLAC).
pub fn decode_file(path: &Path) -> Result<PcmClip> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open audio file: {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }

    let opened = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .with_context(|| format!("Failed to read audio format: {}", path.display()))?;
    let mut format = opened.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("No audio track in {}", path.display()))?;
    let track_id = track.id;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .with_context(|| format!("Failed to create decoder for: {}", path.display()))?;

    let mut samples = Vec::new();
    let mut sample_buf: Option<SampleBuffer<i16>> = None;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track.codec_params.channels.map(|c| c.count() as u16).unwrap_or(0);

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(anyhow!("Error reading packet from {}: {}", path.display(), e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                if sample_buf.is_none() {
                    let spec = *decoded.spec();
                    sample_rate = spec.rate;
                    channels = spec.channels.count() as u16;
                    sample_buf = Some(SampleBuffer::<i16>::new(decoded.capacity() as u64, spec));
                }
                if let Some(buf) = sample_buf.as_mut() {
                    buf.copy_interleaved_ref(decoded);
                    samples.extend_from_slice(buf.samples());
                }
            }
            Err(SymphoniaError::DecodeError(e)) => {
                log::debug!("Skipping undecodable packet in {}: {}", path.display(), e);
            }
            Err(e) => return Err(anyhow!("Failed to decode {}: {}", path.display(), e)),
        }
    }

    if sample_rate == 0 || channels == 0 {
        return Err(anyhow!("Unknown stream format in {}", path.display()));
    }

    Ok(PcmClip {
        samples,
        sample_rate,
        channels,
    })
}

fn wav_spec(clip: &PcmClip) -> hound::WavSpec {
    hound::WavSpec {
        channels: clip.channels,
        sample_rate: clip.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

pub fn encode_wav(clip: &PcmClip) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, wav_spec(clip))?;
        for s in &clip.samples {
            writer.write_sample(*s)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

pub fn decode_wav_bytes(bytes: &[u8]) -> Result<PcmClip> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes)).context("Not a WAV stream")?;
    let spec = reader.spec();
    let samples = match spec.sample_format {
        hound::SampleFormat::Int if spec.bits_per_sample == 16 => {
            reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?
        }
        hound::SampleFormat::Int => {
            let shift = spec.bits_per_sample.saturating_sub(16);
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| (v >> shift) as i16))
                .collect::<Result<Vec<_>, _>>()?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<Result<Vec<_>, _>>()?,
    };
    Ok(PcmClip {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Duration from the WAV header alone.
pub fn wav_duration_ms(path: &Path) -> Result<u64> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open WAV {}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Ok(0);
    }
    Ok(reader.duration() as u64 * 1000 / spec.sample_rate as u64)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Silent 16-bit WAV of `duration_ms`, written straight to disk.
    pub(crate) fn write_silent_wav(path: &Path, duration_ms: u64, sample_rate: u32, channels: u16) {
        let frames = sample_rate as u64 * duration_ms / 1000;
        let clip = PcmClip {
            samples: vec![0; (frames * channels as u64) as usize],
            sample_rate,
            channels,
        };
        std::fs::write(path, encode_wav(&clip).unwrap()).unwrap();
    }

    #[test]
    fn test_wav_round_trip_keeps_duration() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a.wav");
        write_silent_wav(&path, 1500, 16000, 1);

        assert_eq!(wav_duration_ms(&path)?, 1500);
        let clip = decode_file(&path)?;
        assert_eq!(clip.sample_rate, 16000);
        assert_eq!(clip.channels, 1);
        assert_eq!(clip.duration_ms(), 1500);
        Ok(())
    }

    #[test]
    fn test_append_rejects_format_mismatch() {
        let mut a = PcmClip::empty(16000, 1);
        let b = PcmClip::empty(22050, 1);
        assert!(a.append(&b).is_err());

        let c = PcmClip {
            samples: vec![1, 2, 3],
            sample_rate: 16000,
            channels: 1,
        };
        a.append(&c).unwrap();
        assert_eq!(a.samples, vec![1, 2, 3]);
    }

    #[test]
    fn test_convert_keeps_duration_and_adopts_format() -> Result<()> {
        // 1000 ms of stereo 44.1 kHz with distinct channels.
        let stereo = PcmClip {
            samples: (0..44100).flat_map(|_| [8000i16, -8000]).collect(),
            sample_rate: 44100,
            channels: 2,
        };
        let mono = stereo.convert_to(24000, 1)?;
        assert_eq!((mono.sample_rate, mono.channels), (24000, 1));
        assert_eq!(mono.frames(), 24000);
        assert_eq!(mono.duration_ms(), 1000);
        // Opposite channels average out.
        assert!(mono.samples.iter().all(|s| s.abs() <= 1));

        let widened = PcmClip {
            samples: vec![100, 200, 300],
            sample_rate: 8000,
            channels: 1,
        }
        .convert_to(8000, 2)?;
        assert_eq!(widened.samples.len(), 6);
        assert_eq!(widened.samples[0], widened.samples[1]);

        let bytes = encode_wav(&mono)?;
        assert_eq!(decode_wav_bytes(&bytes)?, mono);
        Ok(())
    }
}
