//! Windowed views over the append-only CSV files written by metric collectors.
//!
//! Collectors append one row per sampling interval; the panel only ever needs
//! the most recent samples. Everything here reads, never writes, and reports
//! "no data yet" as `None` so a polling caller can degrade gracefully.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Column that is lifted out of the data map into `MetricsWindow::timestamps`.
pub const TIMESTAMP_COLUMN: &str = "timestamp";

/// Discriminator values at or above this are treated as unusable.
pub const MAX_GROUPS: usize = 256;

const DEVICE_MARKER: &str = "(device:";
const READ_BLOCK: u64 = 64 * 1024;

/// A single CSV cell after best-effort numeric coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Number(f64),
    Text(String),
}

impl SampleValue {
    /// Numbers win whenever the cell parses as a finite float; `nan`/`inf` stay text.
    pub fn parse(cell: &str) -> Self {
        match cell.parse::<f64>() {
            Ok(value) if value.is_finite() => SampleValue::Number(value),
            _ => SampleValue::Text(cell.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SampleValue::Number(value) => Some(*value),
            SampleValue::Text(_) => None,
        }
    }

    /// Interpret the value as a non-negative integer index.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            SampleValue::Number(value) if *value >= 0.0 && value.fract() == 0.0 => {
                Some(*value as usize)
            }
            SampleValue::Number(_) => None,
            SampleValue::Text(text) => text.parse::<usize>().ok(),
        }
    }
}

/// Column-oriented view of the last N rows of a metrics CSV.
///
/// `timestamps[i]` lines up with `data[column][i]` for every column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsWindow {
    pub timestamps: Vec<String>,
    /// Cleaned header names in file order, including the timestamp column.
    pub headers: Vec<String>,
    pub data: BTreeMap<String, Vec<SampleValue>>,
    /// Device name lifted from a `<label> (device: <name>)` header cell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl MetricsWindow {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&[SampleValue]> {
        self.data.get(name).map(Vec::as_slice)
    }

    fn empty_like(&self) -> Self {
        Self {
            timestamps: Vec::new(),
            headers: self.headers.clone(),
            data: self
                .data
                .keys()
                .map(|name| (name.clone(), Vec::new()))
                .collect(),
            device: self.device.clone(),
        }
    }

    fn push_row_from(&mut self, source: &MetricsWindow, row: usize) {
        self.timestamps.push(source.timestamps[row].clone());
        for (name, values) in &source.data {
            if let Some(column) = self.data.get_mut(name.as_str()) {
                column.push(values[row].clone());
            }
        }
    }

    fn reverse_rows(&mut self) {
        self.timestamps.reverse();
        for values in self.data.values_mut() {
            values.reverse();
        }
    }
}

/// One logical series split out of an interleaved CSV, e.g. a single GPU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedWindow {
    pub index: usize,
    #[serde(flatten)]
    pub window: MetricsWindow,
}

/// Normalise a raw header cell into a stable, code-safe column identifier.
pub fn clean_header(cell: &str) -> String {
    let trimmed = cell.trim();
    let stripped = trimmed.strip_prefix('%').unwrap_or(trimmed);
    stripped
        .chars()
        .map(|ch| {
            if ch.is_whitespace() || matches!(ch, '%' | '.' | '[' | ']' | '(' | ')' | '/') {
                '_'
            } else {
                ch
            }
        })
        .collect()
}

/// Split `rkB/s (device: nvme0n1)` into `("rkB/s", Some("nvme0n1"))`.
pub fn split_device_label(cell: &str) -> (&str, Option<&str>) {
    let trimmed = cell.trim();
    let Some(start) = trimmed.find(DEVICE_MARKER) else {
        return (trimmed, None);
    };
    let tail = &trimmed[start + DEVICE_MARKER.len()..];
    let Some(end) = tail.find(')') else {
        return (trimmed, None);
    };
    let name = tail[..end].trim();
    let label = trimmed[..start].trim_end();
    (label, (!name.is_empty()).then_some(name))
}

struct HeaderLayout {
    headers: Vec<String>,
    timestamp: Option<usize>,
    device: Option<String>,
}

impl HeaderLayout {
    fn parse(line: &str) -> Self {
        let mut headers = Vec::new();
        let mut seen = HashSet::new();
        let mut device = None;

        for cell in line.split(',') {
            let (label, cell_device) = split_device_label(cell);
            if device.is_none() {
                device = cell_device.map(str::to_string);
            }

            let base = clean_header(label);
            let mut name = base.clone();
            let mut suffix = 2;
            while !seen.insert(name.clone()) {
                name = format!("{base}_{suffix}");
                suffix += 1;
            }
            headers.push(name);
        }

        let timestamp = headers.iter().position(|name| name == TIMESTAMP_COLUMN);
        Self {
            headers,
            timestamp,
            device,
        }
    }
}

/// Accumulates accepted rows column by column.
struct WindowBuilder<'a> {
    layout: &'a HeaderLayout,
    timestamp_idx: usize,
    timestamps: Vec<String>,
    columns: Vec<Vec<SampleValue>>,
}

impl<'a> WindowBuilder<'a> {
    fn new(layout: &'a HeaderLayout, timestamp_idx: usize, capacity: usize) -> Self {
        Self {
            layout,
            timestamp_idx,
            timestamps: Vec::with_capacity(capacity),
            columns: vec![Vec::with_capacity(capacity); layout.headers.len()],
        }
    }

    /// `cells` must already match the header width.
    fn push<S: AsRef<str>>(&mut self, cells: &[S]) {
        self.timestamps
            .push(cells[self.timestamp_idx].as_ref().to_string());
        for (idx, cell) in cells.iter().enumerate() {
            if idx != self.timestamp_idx {
                self.columns[idx].push(SampleValue::parse(cell.as_ref()));
            }
        }
    }

    fn finish(self) -> MetricsWindow {
        let timestamp_idx = self.timestamp_idx;
        let data = self
            .layout
            .headers
            .iter()
            .zip(self.columns)
            .enumerate()
            .filter(|(idx, _)| *idx != timestamp_idx)
            .map(|(_, (name, values))| (name.clone(), values))
            .collect();

        MetricsWindow {
            timestamps: self.timestamps,
            headers: self.layout.headers.clone(),
            data,
            device: self.layout.device.clone(),
        }
    }
}

/// Strip the line terminator and decode. `None` for bytes that are not UTF-8.
fn decode_line(raw: &[u8]) -> Option<&str> {
    let end = raw
        .iter()
        .rposition(|byte| !matches!(byte, b'\n' | b'\r'))
        .map_or(0, |idx| idx + 1);
    std::str::from_utf8(&raw[..end]).ok()
}

fn is_blank(raw: &[u8]) -> bool {
    raw.iter().all(u8::is_ascii_whitespace)
}

/// First non-blank line, plus the byte offset just past it.
fn read_header(reader: &mut impl BufRead) -> io::Result<Option<(String, u64)>> {
    let mut offset = 0u64;
    let mut raw = Vec::new();
    loop {
        raw.clear();
        let read = reader.read_until(b'\n', &mut raw)?;
        if read == 0 {
            return Ok(None);
        }
        offset += read as u64;
        if is_blank(&raw) {
            continue;
        }
        let header = match decode_line(&raw) {
            Some(line) => line.to_string(),
            None => String::from_utf8_lossy(&raw).trim_end().to_string(),
        };
        return Ok(Some((header, offset)));
    }
}

/// Lines between `floor` and the end of the file, newest first, read in
/// fixed-size blocks from EOF.
struct ReverseLines {
    file: File,
    floor: u64,
    pos: u64,
    carry: Vec<u8>,
    ready: Vec<Vec<u8>>,
}

impl ReverseLines {
    fn new(mut file: File, floor: u64) -> io::Result<Self> {
        let end = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file,
            floor,
            pos: end.max(floor),
            carry: Vec::new(),
            ready: Vec::new(),
        })
    }

    fn fill(&mut self) -> io::Result<()> {
        let start = self.pos.saturating_sub(READ_BLOCK).max(self.floor);
        let mut block = vec![0u8; (self.pos - start) as usize];
        self.file.seek(SeekFrom::Start(start))?;
        self.file.read_exact(&mut block)?;
        self.pos = start;

        block.extend_from_slice(&std::mem::take(&mut self.carry));
        let mut pieces: Vec<Vec<u8>> = block
            .split(|byte| *byte == b'\n')
            .map(<[u8]>::to_vec)
            .collect();
        // the first piece may continue in the previous block
        if self.pos > self.floor && !pieces.is_empty() {
            self.carry = pieces.remove(0);
        }
        self.ready = pieces;
        Ok(())
    }
}

impl Iterator for ReverseLines {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = self.ready.pop() {
                return Some(Ok(line));
            }
            if self.pos == self.floor {
                return None;
            }
            if let Err(err) = self.fill() {
                self.pos = self.floor;
                return Some(Err(err));
            }
        }
    }
}

/// Open `path` and split it into the header and a newest-first line reader.
fn open_series(path: &Path) -> io::Result<Option<(String, ReverseLines)>> {
    let mut reader = BufReader::new(File::open(path)?);
    let Some((header, floor)) = read_header(&mut reader)? else {
        return Ok(None);
    };
    let lines = ReverseLines::new(reader.into_inner(), floor)?;
    Ok(Some((header, lines)))
}

fn log_read_failure(path: &Path, err: &io::Error) {
    if err.kind() == io::ErrorKind::NotFound {
        debug!(path = %path.display(), "metrics file not written yet");
    } else {
        warn!(path = %path.display(), error = %err, "failed to read metrics file");
    }
}

struct TailLines {
    header: String,
    /// Raw data lines, oldest first.
    rows: Vec<Vec<u8>>,
}

fn read_tail(path: &Path, limit: usize) -> io::Result<Option<TailLines>> {
    let Some((header, lines)) = open_series(path)? else {
        return Ok(None);
    };

    let mut rows = Vec::with_capacity(limit.min(1024));
    for raw in lines {
        let raw = raw?;
        if is_blank(&raw) {
            continue;
        }
        rows.push(raw);
        if rows.len() == limit {
            break;
        }
    }
    rows.reverse();
    Ok(Some(TailLines { header, rows }))
}

/// Return the most recent `max_samples` rows of a collector CSV.
///
/// `None` means "no data yet": the file is missing, unreadable, has only a
/// header, or every retained row was malformed.
pub fn extract_window(path: &Path, max_samples: usize) -> Option<MetricsWindow> {
    if max_samples == 0 {
        debug!(path = %path.display(), "zero samples requested");
        return None;
    }

    let tail = match read_tail(path, max_samples) {
        Ok(Some(tail)) => tail,
        Ok(None) => {
            debug!(path = %path.display(), "metrics file is empty");
            return None;
        }
        Err(err) => {
            log_read_failure(path, &err);
            return None;
        }
    };

    build_window(path, tail)
}

fn build_window(path: &Path, tail: TailLines) -> Option<MetricsWindow> {
    let layout = HeaderLayout::parse(&tail.header);
    let Some(timestamp_idx) = layout.timestamp else {
        debug!(path = %path.display(), headers = ?layout.headers, "metrics file has no timestamp column");
        return None;
    };
    if tail.rows.is_empty() {
        debug!(path = %path.display(), "metrics file has no data rows yet");
        return None;
    }

    let expected = layout.headers.len();
    let total = tail.rows.len();
    let mut builder = WindowBuilder::new(&layout, timestamp_idx, total);

    for (idx, raw) in tail.rows.iter().enumerate() {
        let rows_from_end = total - idx;
        let Some(line) = decode_line(raw) else {
            warn!(path = %path.display(), rows_from_end, "dropping metrics row that is not valid UTF-8");
            continue;
        };
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        if cells.len() != expected {
            warn!(
                path = %path.display(),
                rows_from_end,
                expected,
                actual = cells.len(),
                "dropping malformed metrics row"
            );
            continue;
        }
        builder.push(cells.as_slice());
    }

    let window = builder.finish();
    if window.is_empty() {
        debug!(path = %path.display(), "no well-formed rows in window");
        return None;
    }
    Some(window)
}

/// Split an interleaved window into one window per discriminator value.
///
/// Rows are scanned newest first and each group stops accepting rows once it
/// holds `max_samples`, so groups reporting at different rates still get
/// their own most recent samples. Group `i` is always at position `i`; a
/// value that never appears yields an empty window.
pub fn group_by_discriminator(
    window: &MetricsWindow,
    column: &str,
    max_samples: usize,
) -> Vec<GroupedWindow> {
    let Some(values) = window.data.get(column) else {
        warn!(column, headers = ?window.headers, "discriminator column not present");
        return Vec::new();
    };

    let indices: Vec<Option<usize>> = values
        .iter()
        .map(|value| value.as_index().filter(|index| *index < MAX_GROUPS))
        .collect();
    let Some(max_index) = indices.iter().flatten().max().copied() else {
        debug!(column, "no usable discriminator values");
        return Vec::new();
    };

    let group_count = max_index + 1;
    let mut groups: Vec<MetricsWindow> = (0..group_count).map(|_| window.empty_like()).collect();
    let mut counts = vec![0usize; group_count];
    let mut full = 0;
    let mut skipped = 0;

    if max_samples > 0 {
        for row in (0..window.len()).rev() {
            if full == group_count {
                break;
            }
            let Some(group) = indices[row] else {
                skipped += 1;
                continue;
            };
            if counts[group] == max_samples {
                continue;
            }
            groups[group].push_row_from(window, row);
            counts[group] += 1;
            if counts[group] == max_samples {
                full += 1;
            }
        }
    }

    if skipped > 0 {
        warn!(column, skipped, "skipped rows without a usable discriminator");
    }

    groups
        .into_iter()
        .enumerate()
        .map(|(index, mut window)| {
            window.reverse_rows();
            GroupedWindow { index, window }
        })
        .collect()
}

/// Read an interleaved CSV backwards from EOF and group it by `column`.
///
/// Only the rows each group needs are kept, and the scan stops as soon as
/// every group seen so far holds `max_samples` rows.
pub fn extract_grouped(path: &Path, column: &str, max_samples: usize) -> Vec<GroupedWindow> {
    if max_samples == 0 {
        return Vec::new();
    }
    match scan_grouped(path, column, max_samples) {
        Ok(groups) => groups,
        Err(err) => {
            log_read_failure(path, &err);
            Vec::new()
        }
    }
}

fn scan_grouped(path: &Path, column: &str, max_samples: usize) -> io::Result<Vec<GroupedWindow>> {
    let Some((header, lines)) = open_series(path)? else {
        debug!(path = %path.display(), "metrics file is empty");
        return Ok(Vec::new());
    };
    let layout = HeaderLayout::parse(&header);
    let Some(timestamp_idx) = layout.timestamp else {
        debug!(path = %path.display(), headers = ?layout.headers, "metrics file has no timestamp column");
        return Ok(Vec::new());
    };
    let Some(column_idx) = layout.headers.iter().position(|name| name == column) else {
        warn!(path = %path.display(), column, headers = ?layout.headers, "discriminator column not present");
        return Ok(Vec::new());
    };
    let expected = layout.headers.len();

    // newest-first rows per discriminator value
    let mut groups: Vec<Vec<Vec<String>>> = Vec::new();
    let mut full = 0;
    let mut malformed = 0usize;
    let mut skipped = 0usize;

    for raw in lines {
        let raw = raw?;
        if is_blank(&raw) {
            continue;
        }
        let Some(line) = decode_line(&raw) else {
            malformed += 1;
            continue;
        };
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        if cells.len() != expected {
            malformed += 1;
            continue;
        }
        let Some(index) = SampleValue::parse(cells[column_idx])
            .as_index()
            .filter(|index| *index < MAX_GROUPS)
        else {
            skipped += 1;
            continue;
        };

        if index >= groups.len() {
            groups.resize_with(index + 1, Vec::new);
        }
        let rows = &mut groups[index];
        if rows.len() == max_samples {
            continue;
        }
        rows.push(cells.iter().map(|cell| cell.to_string()).collect());
        if rows.len() == max_samples {
            full += 1;
            if full == groups.len() {
                break;
            }
        }
    }

    if malformed > 0 {
        warn!(path = %path.display(), malformed, expected, "dropped malformed metrics rows");
    }
    if skipped > 0 {
        warn!(path = %path.display(), column, skipped, "skipped rows without a usable discriminator");
    }

    Ok(groups
        .into_iter()
        .enumerate()
        .map(|(index, mut rows)| {
            rows.reverse();
            let mut builder = WindowBuilder::new(&layout, timestamp_idx, rows.len());
            for row in &rows {
                builder.push(row.as_slice());
            }
            GroupedWindow {
                index,
                window: builder.finish(),
            }
        })
        .collect())
}
