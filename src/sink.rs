use crate::{SinkSettings, BYTES_PER_WORD};
use clap::ValueEnum;
use log::info;
use serde::Deserialize;
use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

/// On-disk sample layout.
#[derive(Deserialize, ValueEnum, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// Raw little-endian words exactly as captured.
    Bin,
    /// One `I Q` line per sample word.
    Ascii,
}

/// Append-only destination for one channel's samples.
pub trait SampleSink: Send {
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;
}

pub trait SinkFactory: Send + Sync {
    fn open(&self, channel: usize) -> io::Result<Box<dyn SampleSink>>;
}

pub struct FileSink {
    path: PathBuf,
    format: DataFormat,
    writer: Option<BufWriter<File>>,
    bytes_written: u64,
}

impl FileSink {
    pub fn create(path: &Path, format: DataFormat) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            format,
            writer: Some(BufWriter::new(file)),
            bytes_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl SampleSink for FileSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("sink already closed"))?;
        match self.format {
            DataFormat::Bin => writer.write_all(data)?,
            DataFormat::Ascii => {
                for word in data.chunks_exact(BYTES_PER_WORD) {
                    let i = i16::from_le_bytes([word[0], word[1]]);
                    let q = i16::from_le_bytes([word[2], word[3]]);
                    writeln!(writer, "{} {}", i, q)?;
                }
            }
        }
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Opens one `<prefix>_ddc<k>.dat` file per channel inside a fresh
/// `run<N>` directory.
pub struct FileSinkFactory {
    run_dir: PathBuf,
    file_prefix: String,
    format: DataFormat,
}

impl FileSinkFactory {
    pub fn new(settings: &SinkSettings) -> io::Result<Self> {
        let run_dir = create_run_dir(&settings.output_dir)?;
        info!("Writing run data to {}", run_dir.display());
        Ok(Self {
            run_dir,
            file_prefix: settings.file_prefix.clone(),
            format: settings.format,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn channel_path(&self, channel: usize) -> PathBuf {
        self.run_dir
            .join(format!("{}_ddc{}.dat", self.file_prefix, channel + 1))
    }
}

impl SinkFactory for FileSinkFactory {
    fn open(&self, channel: usize) -> io::Result<Box<dyn SampleSink>> {
        let sink = FileSink::create(&self.channel_path(channel), self.format)?;
        Ok(Box::new(sink))
    }
}

/// Create `<output_dir>/run<N>` where N is one past the highest run already
/// present.
pub fn create_run_dir(output_dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(output_dir)?;
    let max_run = fs::read_dir(output_dir)?
        .filter_map(|e| e.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("run"))
                .and_then(|n| n.parse::<usize>().ok())
        })
        .max();
    let next = max_run.map_or(0, |max| max + 1);
    let run_dir = output_dir.join(format!("run{}", next));
    fs::create_dir(&run_dir)?;
    Ok(run_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &Path, format: DataFormat) -> SinkSettings {
        SinkSettings {
            output_dir: dir.to_path_buf(),
            file_prefix: "acq".into(),
            format,
        }
    }

    #[test]
    fn run_directories_count_up() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(create_run_dir(tmp.path()).unwrap(), tmp.path().join("run0"));
        assert_eq!(create_run_dir(tmp.path()).unwrap(), tmp.path().join("run1"));
        fs::create_dir(tmp.path().join("run7")).unwrap();
        fs::create_dir(tmp.path().join("runaway")).unwrap();
        assert_eq!(create_run_dir(tmp.path()).unwrap(), tmp.path().join("run8"));
    }

    #[test]
    fn binary_sink_appends_raw_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = FileSinkFactory::new(&settings(tmp.path(), DataFormat::Bin)).unwrap();
        let mut sink = factory.open(1).unwrap();
        sink.write(&[1, 2, 3, 4]).unwrap();
        sink.write(&[5, 6, 7, 8]).unwrap();
        sink.close().unwrap();
        assert!(sink.write(&[0]).is_err());

        let path = factory.channel_path(1);
        assert!(path.ends_with("run0/acq_ddc2.dat"));
        assert_eq!(fs::read(path).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn ascii_sink_writes_iq_pairs() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = FileSinkFactory::new(&settings(tmp.path(), DataFormat::Ascii)).unwrap();
        let mut sink = factory.open(0).unwrap();
        let mut data = Vec::new();
        data.extend_from_slice(&100i16.to_le_bytes());
        data.extend_from_slice(&(-3i16).to_le_bytes());
        data.extend_from_slice(&(-32768i16).to_le_bytes());
        data.extend_from_slice(&7i16.to_le_bytes());
        sink.write(&data).unwrap();
        sink.close().unwrap();

        let text = fs::read_to_string(factory.channel_path(0)).unwrap();
        assert_eq!(text, "100 -3\n-32768 7\n");
    }

    #[test]
    fn format_names_match_config_and_cli() {
        assert_eq!(DataFormat::from_str("ascii", false), Ok(DataFormat::Ascii));
        assert_eq!(DataFormat::from_str("bin", false), Ok(DataFormat::Bin));
        assert!(DataFormat::from_str("hdf5", false).is_err());
    }
}
