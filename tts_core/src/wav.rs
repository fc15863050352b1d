use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;

/// Encode PCM f32 samples as 16-bit mono PCM WAV (RIFF).
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    // header (44 bytes) + 2 bytes per sample
    let mut cursor = Cursor::new(Vec::<u8>::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| anyhow::anyhow!("wav write err: {e}"))?;
        const I16_MAX_F32: f32 = i16::MAX as f32;
        for &s in samples {
            let v = (s.clamp(-1.0, 1.0) * I16_MAX_F32) as i16;
            writer
                .write_sample(v)
                .map_err(|e| anyhow::anyhow!("wav sample err: {e}"))?;
        }
        writer
            .finalize()
            .map_err(|e| anyhow::anyhow!("wav finalize err: {e}"))?;
    }
    Ok(cursor.into_inner())
}

/// `duration` of silence at `sample_rate`
pub fn silence(duration: Duration, sample_rate: u32) -> Vec<f32> {
    let n = (duration.as_secs_f64() * sample_rate as f64).round() as usize;
    vec![0.0; n]
}

/// Playing time of a WAV file
pub fn wav_duration<P: AsRef<Path>>(path: P) -> anyhow::Result<Duration> {
    let reader = hound::WavReader::open(path.as_ref())
        .with_context(|| format!("Failed to open WAV {}", path.as_ref().display()))?;
    Ok(duration_of(&reader))
}

/// Playing time of an in-memory WAV
pub fn wav_duration_from_bytes(bytes: &[u8]) -> anyhow::Result<Duration> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).context("Invalid WAV data")?;
    Ok(duration_of(&reader))
}

fn duration_of<R: std::io::Read>(reader: &hound::WavReader<R>) -> Duration {
    let rate = reader.spec().sample_rate.max(1);
    // duration() counts samples per channel
    Duration::from_secs_f64(reader.duration() as f64 / rate as f64)
}
