//! zip 打包：批量上传与批量下载共用。
//!
//! 逐个成员经固定缓冲区拷贝，内存不随归档大小增长。源无法打开或读取失败时跳过；
//! 写入目标失败则整个归档结束。

use chrono::{DateTime, Datelike, Local, Timelike};
use std::cell::Cell;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::SystemTime;
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const COPY_BUFFER_SIZE: usize = 64 * 1024;
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// 按需打开的成员数据源。
pub trait EntrySource {
    type Reader: Read;

    fn open(&self) -> io::Result<OpenedEntry<Self::Reader>>;
}

pub struct OpenedEntry<R> {
    pub reader: R,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl EntrySource for PathBuf {
    type Reader = File;

    fn open(&self) -> io::Result<OpenedEntry<Self::Reader>> {
        let file = File::open(self)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            ));
        }
        Ok(OpenedEntry {
            reader: file,
            size: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

pub struct ArchiveEntry<S> {
    pub name: String,
    pub source: S,
}

impl<S> ArchiveEntry<S> {
    pub fn new(name: impl Into<String>, source: S) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }
}

#[derive(Debug, Default)]
pub struct ArchiveOutcome {
    pub written: usize,
    pub skipped: Vec<String>,
}

#[derive(Debug)]
pub enum ArchiveError {
    Io(io::Error),
    Zip(ZipError),
}

impl From<io::Error> for ArchiveError {
    fn from(err: io::Error) -> Self {
        ArchiveError::Io(err)
    }
}

impl From<ZipError> for ArchiveError {
    fn from(err: ZipError) -> Self {
        match err {
            ZipError::Io(err) => ArchiveError::Io(err),
            other => ArchiveError::Zip(other),
        }
    }
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::Io(err) => write!(f, "archive i/o error: {err}"),
            ArchiveError::Zip(err) => write!(f, "archive encoder error: {err}"),
        }
    }
}

/// 可回退、可截断的归档目标。
pub trait ArchiveFile: Write + Seek {
    fn truncate_at(&mut self, len: u64) -> io::Result<()>;
}

impl ArchiveFile for File {
    fn truncate_at(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

impl<T: ArchiveFile + ?Sized> ArchiveFile for &mut T {
    fn truncate_at(&mut self, len: u64) -> io::Result<()> {
        (**self).truncate_at(len)
    }
}

/// 写入可回退的目标（文件）。
///
/// 中途失败的成员会被回退并截掉，下一个成员从它的位置开始写。
pub fn write_archive<S, W>(
    entries: impl IntoIterator<Item = ArchiveEntry<S>>,
    sink: W,
) -> Result<ArchiveOutcome, ArchiveError>
where
    S: EntrySource,
    W: ArchiveFile,
{
    let rewinding = Rc::new(Cell::new(false));
    let sink = RewindSink {
        inner: sink,
        rewinding: rewinding.clone(),
    };
    let (outcome, _) = fill_archive(ZipWriter::new(sink), entries, |zip, _| {
        rewinding.set(true);
        let aborted = zip.abort_file();
        rewinding.set(false);
        aborted.map_err(ArchiveError::from)
    })?;
    Ok(outcome)
}

/// 回退失败成员时一并截断，避免死字节留在归档中间。
struct RewindSink<W> {
    inner: W,
    rewinding: Rc<Cell<bool>>,
}

impl<W: Write> Write for RewindSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: ArchiveFile> Seek for RewindSink<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let at = self.inner.seek(pos)?;
        if self.rewinding.get() {
            self.inner.truncate_at(at)?;
        }
        Ok(at)
    }
}

/// 写入只进不退的目标（HTTP 响应）。
///
/// 已发出的字节无法收回，成员中途失败时归档停在上一个完整成员之后，不再写中央目录。
pub fn stream_archive<S, W>(
    entries: impl IntoIterator<Item = ArchiveEntry<S>>,
    sink: W,
) -> Result<ArchiveOutcome, ArchiveError>
where
    S: EntrySource,
    W: Write,
{
    let blown = Rc::new(Cell::new(false));
    let sink = FusedSink {
        inner: sink,
        blown: blown.clone(),
    };
    let (outcome, _) = fill_archive(ZipWriter::new_stream(sink), entries, |_, err| {
        blown.set(true);
        Err(ArchiveError::Io(err))
    })?;
    Ok(outcome)
}

/// 出错后拒绝一切写入，`ZipWriter` 在 drop 时也无法再补写中央目录。
struct FusedSink<W> {
    inner: W,
    blown: Rc<Cell<bool>>,
}

impl<W> FusedSink<W> {
    fn check(&self) -> io::Result<()> {
        if self.blown.get() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "archive stream already failed",
            ));
        }
        Ok(())
    }
}

impl<W: Write> Write for FusedSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check()?;
        self.inner.write(buf).inspect_err(|_| self.blown.set(true))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check()?;
        self.inner.flush().inspect_err(|_| self.blown.set(true))
    }
}

enum CopyError {
    Source(io::Error),
    Sink(io::Error),
}

fn fill_archive<S, W, F>(
    mut zip: ZipWriter<W>,
    entries: impl IntoIterator<Item = ArchiveEntry<S>>,
    mut abandon: F,
) -> Result<(ArchiveOutcome, W), ArchiveError>
where
    S: EntrySource,
    W: Write + Seek,
    F: FnMut(&mut ZipWriter<W>, io::Error) -> Result<(), ArchiveError>,
{
    let mut outcome = ArchiveOutcome::default();
    let mut seen = HashSet::new();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];

    for ArchiveEntry { name, source } in entries {
        if seen.contains(&name) {
            warn!(name, "duplicate archive member skipped");
            outcome.skipped.push(name);
            continue;
        }
        let opened = match source.open() {
            Ok(opened) => opened,
            Err(err) => {
                warn!(name, error = %err, "archive source unavailable, skipped");
                outcome.skipped.push(name);
                continue;
            }
        };

        zip.start_file(name.as_str(), member_options(&opened))?;
        match copy_member(opened.reader, &mut zip, &mut buffer) {
            Ok(bytes) => {
                debug!(name, bytes, "archive member written");
                seen.insert(name);
                outcome.written += 1;
            }
            Err(CopyError::Source(err)) => {
                warn!(name, error = %err, "archive source failed mid-copy, member abandoned");
                abandon(&mut zip, err)?;
                outcome.skipped.push(name);
            }
            Err(CopyError::Sink(err)) => return Err(ArchiveError::Io(err)),
        }
    }

    let sink = zip.finish()?;
    Ok((outcome, sink))
}

fn copy_member<R: Read, W: Write>(
    mut reader: R,
    writer: &mut W,
    buffer: &mut [u8],
) -> Result<u64, CopyError> {
    let mut copied = 0u64;
    loop {
        let read = match reader.read(buffer) {
            Ok(0) => return Ok(copied),
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(CopyError::Source(err)),
        };
        writer
            .write_all(&buffer[..read])
            .map_err(CopyError::Sink)?;
        copied += read as u64;
    }
}

fn member_options<R>(opened: &OpenedEntry<R>) -> SimpleFileOptions {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(opened.size >= ZIP64_THRESHOLD);
    match opened.modified.and_then(zip_time) {
        Some(time) => options.last_modified_time(time),
        None => options,
    }
}

/// `<prefix>_<YYYYMMDD_HHMMSS>.zip`，同一秒内会重名。
pub fn timestamped_name(prefix: &str, at: DateTime<Local>) -> String {
    format!("{prefix}_{}.zip", at.format("%Y%m%d_%H%M%S"))
}

fn zip_time(modified: SystemTime) -> Option<zip::DateTime> {
    let local: DateTime<Local> = modified.into();
    zip::DateTime::from_date_and_time(
        u16::try_from(local.year()).ok()?,
        local.month() as u8,
        local.day() as u8,
        local.hour() as u8,
        local.minute() as u8,
        local.second() as u8,
    )
    .ok()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::io::Cursor;
    use zip::ZipArchive;

    pub enum TestSource {
        Bytes(&'static [u8]),
        Missing,
        BrokenAfter(Vec<u8>),
    }

    struct BrokenReader {
        head: Cursor<Vec<u8>>,
    }

    impl Read for BrokenReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.head.read(buf)? {
                0 => Err(io::Error::other("device went away")),
                read => Ok(read),
            }
        }
    }

    impl EntrySource for TestSource {
        type Reader = Box<dyn Read>;

        fn open(&self) -> io::Result<OpenedEntry<Self::Reader>> {
            let (reader, size): (Box<dyn Read>, u64) = match self {
                TestSource::Bytes(bytes) => (Box::new(*bytes), bytes.len() as u64),
                TestSource::Missing => return Err(io::Error::from(io::ErrorKind::NotFound)),
                TestSource::BrokenAfter(head) => (
                    Box::new(BrokenReader {
                        head: Cursor::new(head.clone()),
                    }),
                    head.len() as u64 * 2,
                ),
            };
            Ok(OpenedEntry {
                reader,
                size,
                modified: None,
            })
        }
    }

    impl ArchiveFile for Cursor<Vec<u8>> {
        fn truncate_at(&mut self, len: u64) -> io::Result<()> {
            self.get_mut().truncate(len as usize);
            Ok(())
        }
    }

    /// 不可压缩的伪随机数据。
    pub fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x2545_f491_4f6c_dd1du64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    pub fn read_members(bytes: Vec<u8>) -> Vec<(String, Vec<u8>)> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).expect("valid archive");
        (0..archive.len())
            .map(|index| {
                let mut member = archive.by_index(index).expect("member");
                let mut content = Vec::new();
                member.read_to_end(&mut content).expect("member content");
                (member.name().to_string(), content)
            })
            .collect()
    }

    pub fn has_end_record(bytes: &[u8]) -> bool {
        bytes.len() >= 22 && bytes[bytes.len() - 22..].starts_with(b"PK\x05\x06")
    }

    /// 截断的流式归档：与只含已完成成员的完整归档比对前缀，再拼上后者的中央目录读回。
    pub fn closed_members(truncated: &[u8], complete: &[u8]) -> Vec<(String, Vec<u8>)> {
        let central = complete
            .windows(4)
            .position(|window| window == b"PK\x01\x02")
            .expect("central directory");
        assert!(truncated.len() >= central, "closed members missing");
        assert_eq!(&truncated[..central], &complete[..central]);
        let mut repaired = truncated[..central].to_vec();
        repaired.extend_from_slice(&complete[central..]);
        read_members(repaired)
    }
}
