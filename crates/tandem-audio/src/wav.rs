//! WAV encoding for the session asset and for wire payloads.

use anyhow::{Context, Result};
use std::io::Cursor;
use std::path::{Path, PathBuf};

fn spec_16bit_mono(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

fn float_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Encode f32 mono samples as in-memory 16-bit WAV bytes.
pub fn samples_to_wav_bytes(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec_16bit_mono(sample_rate))?;
        for &sample in samples {
            writer.write_sample(float_to_i16(sample))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Incremental writer for the full-session WAV asset.
///
/// The mixer appends each mixed frame as it is produced; `finalize` patches
/// the header and returns the path for diarization.
pub struct WavAssetWriter {
    writer: Option<hound::WavWriter<std::io::BufWriter<std::fs::File>>>,
    path: PathBuf,
}

impl WavAssetWriter {
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let writer = hound::WavWriter::create(&path, spec_16bit_mono(sample_rate))
            .with_context(|| format!("Failed to create WAV file {}", path.display()))?;
        Ok(Self {
            writer: Some(writer),
            path,
        })
    }

    pub fn append(&mut self, samples: &[f32]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .context("WAV writer already finalized")?;
        for &sample in samples {
            writer.write_sample(float_to_i16(sample))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finish the file and return its path.
    pub fn finalize(mut self) -> Result<PathBuf> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().context("Failed to finalize WAV file")?;
        }
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_bytes_round_trip() {
        let samples = vec![0.0, 0.5, -0.5, 1.0, -1.0];
        let bytes = samples_to_wav_bytes(&samples, 16000).unwrap();

        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, 16000);
        let decoded: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded.len(), samples.len());
        assert_eq!(decoded[0], 0);
        assert_eq!(decoded[3], 32767);
    }

    #[test]
    fn clipping_saturates_instead_of_wrapping() {
        let bytes = samples_to_wav_bytes(&[2.0, -2.0], 16000).unwrap();
        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        let decoded: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, vec![32767, -32768]);
    }

    #[test]
    fn asset_writer_appends_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.wav");

        let mut writer = WavAssetWriter::create(&path, 16000).unwrap();
        writer.append(&[0.1; 160]).unwrap();
        writer.append(&[0.2; 320]).unwrap();
        let finished = writer.finalize().unwrap();
        assert_eq!(finished, path);

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.len(), 480);
    }
}
