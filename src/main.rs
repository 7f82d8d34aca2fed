use clap::Parser;
use log::{debug, info, warn};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Parser)]
#[command(name = "karyolook")]
#[command(about = "Visualize chromosome ideograms and interval density in 2D.", long_about = None)]
struct Args {
    // ANNOTATION OPTIONS
    /// Load chromosome names and lengths from this chrom.sizes FILE.
    #[arg(short = 's', long = "sizes", value_name = "FILE")]
    sizes: Option<PathBuf>,

    /// Load cytogenetic banding from this UCSC cytoBandIdeo FILE.
    #[arg(short = 'c', long = "cytobands", value_name = "FILE")]
    cytobands: Option<PathBuf>,

    // DATASET OPTIONS
    /// Bin intervals from this BED-like FILE into a density track (repeatable).
    #[arg(short = 'd', long = "data", value_name = "FILE")]
    data: Vec<PathBuf>,

    /// Track label for the dataset at the same position (defaults to the file stem).
    #[arg(short = 'l', long = "label", value_name = "STRING")]
    labels: Vec<String>,

    // OUTPUT
    /// Write the SVG document to this FILE instead of standard output.
    #[arg(short = 'o', long = "out", value_name = "FILE")]
    out: Option<PathBuf>,

    // LAYOUT OPTIONS
    /// Pair chromosomes into a two-column stacked layout.
    #[arg(short = 'k', long = "stacked")]
    stacked: bool,

    /// Base pairs per horizontal unit (also the raster bin width).
    #[arg(short = 'S', long = "scale", value_name = "BP", default_value_t = 500_000.0)]
    scale: f64,

    /// The height of one interval-density track.
    #[arg(long = "track-height", value_name = "N", default_value_t = 10.0)]
    track_height: f64,

    /// Vertical gap between density tracks.
    #[arg(long = "track-gap", value_name = "N", default_value_t = 2.0)]
    track_gap: f64,

    /// The height of the banded ideogram.
    #[arg(long = "cytoband-height", value_name = "N", default_value_t = 14.0)]
    cytoband_height: f64,

    /// The height of the flat bar drawn when no banding data is loaded.
    #[arg(long = "bar-height", value_name = "N", default_value_t = 6.0)]
    bar_height: f64,

    /// Font size for chromosome labels.
    #[arg(short = 'T', long = "text-size", value_name = "N", default_value_t = 12.0)]
    text_size: f64,

    /// Horizontal gap between the two columns of a stack.
    #[arg(long = "column-gap", value_name = "N", default_value_t = 20.0)]
    column_gap: f64,

    /// Gap between a chromosome label and its figure.
    #[arg(long = "text-gap", value_name = "N", default_value_t = 5.0)]
    text_gap: f64,

    /// Vertical gap between stack rows.
    #[arg(long = "stack-gap", value_name = "N", default_value_t = 10.0)]
    stack_gap: f64,

    /// Padding around each stack entry.
    #[arg(short = 'b', long = "border", value_name = "N", default_value_t = 5.0)]
    border: f64,

    // FILTERING OPTIONS
    /// Include unplaced, random and alt contigs.
    #[arg(short = 'R', long = "include-non-regular")]
    include_non_regular: bool,

    /// Include the mitochondrial chromosome.
    #[arg(short = 'M', long = "include-mito")]
    include_mito: bool,

    // Logging
    /// Verbosity level (0 = error, 1 = info, 2 = debug).
    #[arg(short = 'v', long = "verbose", value_name = "N", default_value_t = 1)]
    verbose: u8,
}

/// Empirical average glyph width as a fraction of the text size; label
/// gutters are sized from this so no font metrics are ever consulted.
const TEXT_RATIO: f64 = 0.6;

/// Fill for chromosomes rendered without banding data.
const FLAT_BAR_FILL: &str = "#c4c4c4";

#[derive(Error, Debug)]
enum KaryoError {
    #[error("{file}:{line}: {reason}")]
    MalformedAnnotation {
        file: String,
        line: usize,
        reason: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Giemsa stain code from the cytoband annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Stain {
    Gneg,
    Gpos(u8),
    Acen,
    Gvar,
    Stalk,
    Other(String),
}

impl Stain {
    /// Never fails: anything outside the known vocabulary becomes `Other`,
    /// and a `gpos` with a missing or unreadable percentage reads as 0.
    fn parse(token: &str) -> Stain {
        match token {
            "gneg" => Stain::Gneg,
            "acen" => Stain::Acen,
            "gvar" => Stain::Gvar,
            "stalk" => Stain::Stalk,
            _ if token.starts_with("gpos") => Stain::Gpos(token[4..].parse().unwrap_or(0)),
            _ => Stain::Other(token.to_string()),
        }
    }
}

/// Fill treatment for one band: black at `opacity`, optionally hatched on top.
#[derive(Debug, Clone, Copy, PartialEq)]
struct BandPaint {
    opacity: f64,
    hatched: bool,
}

/// `acen` bands are never painted; they only define the arm boundary.
fn band_paint(stain: &Stain) -> Option<BandPaint> {
    let (opacity, hatched) = match stain {
        Stain::Gneg | Stain::Other(_) => (0.0, false),
        Stain::Gpos(n) => ((f64::from(*n) / 100.0).clamp(0.0, 1.0), false),
        Stain::Gvar => (1.0, true),
        Stain::Stalk => (0.75, true),
        Stain::Acen => return None,
    };
    Some(BandPaint { opacity, hatched })
}

/// Half-open genomic interval `[start, end)`.
#[derive(Debug, Clone)]
struct Interval {
    chrom: String,
    start: u64,
    end: u64,
    name: Option<String>,
}

impl Interval {
    fn new(chrom: &str, start: u64, end: u64) -> Self {
        Interval {
            chrom: chrom.to_string(),
            start,
            end,
            name: None,
        }
    }

    /// Abutting intervals do not overlap.
    fn overlaps(&self, other: &Interval) -> bool {
        self.chrom == other.chrom && self.start < other.end && other.start < self.end
    }

    /// Canonical ordering: chromosome name (natural), then start, then end.
    fn canonical_cmp(&self, other: &Interval) -> Ordering {
        compare_chrom_names(&self.chrom, &other.chrom)
            .then_with(|| self.start.cmp(&other.start))
            .then_with(|| self.end.cmp(&other.end))
    }
}

/// Strip the UCSC `chr` prefix if present.
fn chrom_key(name: &str) -> &str {
    name.strip_prefix("chr").unwrap_or(name)
}

/// The chromosome number, if the name (minus any `chr` prefix) is all digits.
fn chrom_number(name: &str) -> Option<u64> {
    let key = chrom_key(name);
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

fn is_mito_name(name: &str) -> bool {
    let key = chrom_key(name);
    key.eq_ignore_ascii_case("m") || key.eq_ignore_ascii_case("mt")
}

/// Natural chromosome-name order: numbered chromosomes numerically first,
/// the mitochondrial contig last, everything else lexicographic in between.
/// Plain lexicographic order would put chr10 before chr2 and pair the wrong
/// chromosomes in the stacked layout.
fn compare_chrom_names(a: &str, b: &str) -> Ordering {
    fn rank(name: &str) -> u8 {
        if chrom_number(name).is_some() {
            0
        } else if is_mito_name(name) {
            2
        } else {
            1
        }
    }
    rank(a)
        .cmp(&rank(b))
        .then_with(|| match (chrom_number(a), chrom_number(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => chrom_key(a).cmp(chrom_key(b)),
        })
        .then_with(|| a.cmp(b))
}

/// One Giemsa band; `span.name` carries the band name, which real UCSC files
/// leave blank on some alt contigs.
#[derive(Debug, Clone)]
struct Cytoband {
    span: Interval,
    stain: Stain,
}

/// One chromosome or contig with its banding and per-dataset bin counts.
#[derive(Debug)]
struct Chromosome {
    name: String,
    length: u64,
    /// Kept canonically sorted after every insertion.
    cytobands: Vec<Cytoband>,
    /// Merged span of all `acen` bands.
    centromere: Option<Cytoband>,
    /// Dataset label to raster-bin occupancy counts.
    data: FxHashMap<String, Vec<u64>>,
}

impl Chromosome {
    fn new(name: &str, length: u64) -> Self {
        Chromosome {
            name: name.to_string(),
            length,
            cytobands: Vec::new(),
            centromere: None,
            data: FxHashMap::default(),
        }
    }

    fn is_numbered(&self) -> bool {
        chrom_number(&self.name).is_some()
    }

    fn is_mitochondrial(&self) -> bool {
        is_mito_name(&self.name)
    }

    /// Unplaced, random and alt contigs carry an underscore in UCSC naming
    /// (chr1_KI270706v1_random, chrUn_KI270302v1, chr19_GL383573v1_alt).
    fn is_regular(&self) -> bool {
        !self.name.contains('_') && !self.is_mitochondrial()
    }

    /// Append a band, keep the band list sorted, fold `acen` bands into the
    /// centromere and grow `length` to cover the band. Two `acen` bands merge
    /// to [min(starts), max(ends)] whichever order the file lists them in.
    fn add_cytoband(&mut self, band: Cytoband) {
        if band.span.end > self.length {
            self.length = band.span.end;
        }
        if band.stain == Stain::Acen {
            match &mut self.centromere {
                Some(cen) => {
                    cen.span.start = cen.span.start.min(band.span.start);
                    cen.span.end = cen.span.end.max(band.span.end);
                }
                None => self.centromere = Some(band.clone()),
            }
        }
        self.cytobands.push(band);
        self.cytobands.sort_by(|a, b| a.span.canonical_cmp(&b.span));
    }

    /// Number of raster bins at `scale` base pairs per bin.
    fn bin_count(&self, scale: f64) -> usize {
        (self.length as f64 / scale).ceil() as usize + 1
    }

    /// Allocate the bin array for a dataset label. Calling this twice for the
    /// same label keeps the existing counts (warned, not an error).
    fn init_label(&mut self, label: &str, scale: f64) {
        if self.data.contains_key(label) {
            warn!(
                "track '{}' already initialized on {}, keeping existing counts",
                label, self.name
            );
            return;
        }
        let bins = self.bin_count(scale);
        self.data.insert(label.to_string(), vec![0; bins]);
    }

    /// Increment every bin the interval touches, from round(start/scale)
    /// through round(end/scale) inclusive. An interval on another chromosome
    /// or an unknown label is a no-op; positions past the end saturate the
    /// last bin rather than growing the array.
    fn add_interval(&mut self, label: &str, interval: &Interval, scale: f64) {
        if interval.chrom != self.name {
            return;
        }
        let bins = match self.data.get_mut(label) {
            Some(bins) => bins,
            None => return,
        };
        if bins.is_empty() {
            return;
        }
        let cap = bins.len() - 1;
        let first = ((interval.start as f64 / scale).round() as usize).min(cap);
        let last = ((interval.end as f64 / scale).round() as usize).min(cap);
        for bin in bins[first..=last].iter_mut() {
            *bin += 1;
        }
    }

    /// Arm spans around the centromere, in base pairs. No cytobands means no
    /// arms: the chromosome renders as a single flat bar instead.
    fn arms(&self) -> Vec<Interval> {
        if self.cytobands.is_empty() {
            return Vec::new();
        }
        match &self.centromere {
            Some(cen) => vec![
                Interval::new(&self.name, 0, cen.span.start),
                Interval::new(&self.name, cen.span.end, self.length),
            ],
            None => vec![Interval::new(&self.name, 0, self.length)],
        }
    }
}

/// Chromosome collection under construction: an insertion-ordered list plus a
/// name index, always updated together. All ingestion (annotation parsing and
/// dataset binning) happens here; everything downstream reads the frozen
/// `Karyotype`.
struct KaryotypeBuilder {
    chromosomes: Vec<Chromosome>,
    index: FxHashMap<String, usize>,
}

impl KaryotypeBuilder {
    fn new() -> Self {
        KaryotypeBuilder {
            chromosomes: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    /// Look up or create a chromosome. The first declared length wins; later
    /// sights return the existing record untouched.
    fn ensure(&mut self, name: &str, length: u64) -> &mut Chromosome {
        let idx = match self.index.get(name) {
            Some(&idx) => idx,
            None => {
                let idx = self.chromosomes.len();
                self.chromosomes.push(Chromosome::new(name, length));
                self.index.insert(name.to_string(), idx);
                idx
            }
        };
        &mut self.chromosomes[idx]
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Chromosome> {
        let idx = *self.index.get(name)?;
        Some(&mut self.chromosomes[idx])
    }

    /// Bin one dataset onto every chromosome it references. Intervals naming
    /// a chromosome absent from the annotation are dropped.
    fn rasterize(&mut self, label: &str, intervals: &[Interval], scale: f64) {
        for chromosome in &mut self.chromosomes {
            chromosome.init_label(label, scale);
        }
        let mut dropped = 0usize;
        for interval in intervals {
            match self.get_mut(&interval.chrom) {
                Some(chromosome) => chromosome.add_interval(label, interval, scale),
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            debug!(
                "{}: dropped {} intervals referencing unknown chromosomes",
                label, dropped
            );
        }
    }

    /// Freeze into the read-only collection used by every later stage.
    fn finish(self) -> Karyotype {
        Karyotype {
            chromosomes: self.chromosomes,
        }
    }
}

/// Frozen chromosome collection; stacking, layout and rendering only read it.
struct Karyotype {
    chromosomes: Vec<Chromosome>,
}

impl Karyotype {
    fn has_cytobands(&self) -> bool {
        self.chromosomes.iter().any(|c| !c.cytobands.is_empty())
    }
}

fn annotation_error(file: &str, line_no: usize, reason: String) -> KaryoError {
    KaryoError::MalformedAnnotation {
        file: file.to_string(),
        line: line_no + 1,
        reason,
    }
}

fn parse_coord(token: &str, file: &str, line_no: usize) -> Result<u64, KaryoError> {
    token
        .parse()
        .map_err(|_| annotation_error(file, line_no, format!("invalid coordinate '{}'", token)))
}

/// Parse a chrom.sizes annotation: `name  size` per line, whitespace
/// delimited. Duplicate names keep the first size.
fn parse_sizes<R: BufRead>(
    reader: R,
    file: &str,
    builder: &mut KaryotypeBuilder,
) -> Result<(), KaryoError> {
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        if tokens.len() != 2 {
            return Err(annotation_error(
                file,
                line_no,
                format!("expected 2 fields (name, size), got {}", tokens.len()),
            ));
        }
        let size = parse_coord(tokens[1], file, line_no)?;
        builder.ensure(tokens[0], size);
    }
    Ok(())
}

/// Parse a cytoBandIdeo annotation: `chrom  start  end  band  stain` per
/// line. Rows with a blank band name tokenize to 4 fields; the stain is
/// always the last field. A chromosome seen here for the first time is sized
/// to the band end and grows with later bands.
fn parse_cytobands<R: BufRead>(
    reader: R,
    file: &str,
    builder: &mut KaryotypeBuilder,
) -> Result<(), KaryoError> {
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        if tokens.len() != 4 && tokens.len() != 5 {
            return Err(annotation_error(
                file,
                line_no,
                format!(
                    "expected 5 fields (chrom, start, end, band, stain), got {}",
                    tokens.len()
                ),
            ));
        }
        let start = parse_coord(tokens[1], file, line_no)?;
        let end = parse_coord(tokens[2], file, line_no)?;
        if end < start {
            return Err(annotation_error(
                file,
                line_no,
                format!("band end {} precedes start {}", end, start),
            ));
        }
        let band_name = if tokens.len() == 5 { tokens[3] } else { "" };
        let stain = Stain::parse(tokens[tokens.len() - 1]);
        let band = Cytoband {
            span: Interval {
                chrom: tokens[0].to_string(),
                start,
                end,
                name: (!band_name.is_empty()).then(|| band_name.to_string()),
            },
            stain,
        };
        builder.ensure(tokens[0], end).add_cytoband(band);
    }
    Ok(())
}

fn parse_sizes_file(path: &Path, builder: &mut KaryotypeBuilder) -> Result<(), KaryoError> {
    let file = File::open(path)?;
    parse_sizes(BufReader::new(file), &path.display().to_string(), builder)
}

fn parse_cytobands_file(path: &Path, builder: &mut KaryotypeBuilder) -> Result<(), KaryoError> {
    let file = File::open(path)?;
    parse_cytobands(BufReader::new(file), &path.display().to_string(), builder)
}

/// Read BED-like records: `chrom  start  end  [name ...]`. Score, strand and
/// later columns are ignored; header lines and unparsable lines are skipped
/// with a warning rather than failing the dataset.
fn parse_bed<R: BufRead>(reader: R, source: &str) -> std::io::Result<Vec<Interval>> {
    let mut intervals = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty()
            || line.starts_with('#')
            || line.starts_with("track")
            || line.starts_with("browser")
        {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 3 {
            warn!(
                "{}:{}: skipping line with fewer than 3 fields",
                source,
                line_no + 1
            );
            continue;
        }
        let (start, end) = match (tokens[1].parse::<u64>(), tokens[2].parse::<u64>()) {
            (Ok(start), Ok(end)) if start <= end => (start, end),
            _ => {
                warn!("{}:{}: skipping unparsable interval", source, line_no + 1);
                continue;
            }
        };
        intervals.push(Interval {
            chrom: tokens[0].to_string(),
            start,
            end,
            name: tokens.get(3).map(|s| s.to_string()),
        });
    }
    Ok(intervals)
}

fn load_bed(path: &Path) -> std::io::Result<Vec<Interval>> {
    let file = File::open(path)?;
    parse_bed(BufReader::new(file), &path.display().to_string())
}

/// Load every dataset file in parallel. A dataset that cannot be read is
/// dropped with a warning and contributes no track; the run continues.
fn load_datasets(paths: &[PathBuf], labels: &[String]) -> Vec<(String, Vec<Interval>)> {
    paths
        .par_iter()
        .enumerate()
        .filter_map(|(i, path)| {
            let label = labels.get(i).cloned().unwrap_or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("dataset{}", i + 1))
            });
            match load_bed(path) {
                Ok(intervals) => {
                    info!("{}: {} intervals from {:?}", label, intervals.len(), path);
                    Some((label, intervals))
                }
                Err(e) => {
                    warn!("skipping dataset {:?}: {}", path, e);
                    None
                }
            }
        })
        .collect()
}

/// Canonically sorted chromosomes that survive the inclusion rules. The rule
/// is a union, not a gate: --include-mito readmits the mitochondrial
/// chromosome even while non-regular contigs stay excluded, and
/// --include-non-regular admits it without --include-mito.
fn filter_chromosomes(
    karyotype: &Karyotype,
    include_non_regular: bool,
    include_mito: bool,
) -> Vec<&Chromosome> {
    let mut list: Vec<&Chromosome> = karyotype
        .chromosomes
        .iter()
        .filter(|c| include_non_regular || c.is_regular() || (include_mito && c.is_mitochondrial()))
        .collect();
    list.sort_by(|a, b| compare_chrom_names(&a.name, &b.name));
    list
}

/// Complementary pairing: stack 0 holds the first and last chromosome,
/// stack 1 the second and second-to-last, and so on. An odd count leaves the
/// middle chromosome in a single-column stack.
fn stack_pairs<'a>(list: &[&'a Chromosome]) -> Vec<Vec<&'a Chromosome>> {
    let n = list.len();
    let half = (n + 1) / 2;
    let mut stacks: Vec<Vec<&Chromosome>> = list[..half].iter().map(|c| vec![*c]).collect();
    for i in half..n {
        stacks[n - 1 - i].push(list[i]);
    }
    stacks
}

/// Two-column layout: numbered chromosomes pair among themselves, then the
/// non-numbered remainder pairs among itself, so autosomes never share a row
/// with sex chromosomes or leftover contigs.
fn stacked_chromosomes<'a>(sorted: &[&'a Chromosome]) -> Vec<Vec<&'a Chromosome>> {
    let numbered: Vec<&Chromosome> = sorted.iter().copied().filter(|c| c.is_numbered()).collect();
    let others: Vec<&Chromosome> = sorted.iter().copied().filter(|c| !c.is_numbered()).collect();
    let mut stacks = stack_pairs(&numbered);
    stacks.extend(stack_pairs(&others));
    stacks
}

/// One chromosome per row when stacking is off.
fn single_stacks<'a>(sorted: &[&'a Chromosome]) -> Vec<Vec<&'a Chromosome>> {
    sorted.iter().map(|c| vec![*c]).collect()
}

/// Resolved canvas geometry, computed analytically before any drawing. The
/// drawing stage receives this value and never measures anything itself.
#[derive(Debug)]
struct Layout {
    width: f64,
    height: f64,
    /// Label gutter width per column; index 1 stays 0 without a second column.
    label_width: [f64; 2],
    entry_height: f64,
    /// Left edge of column-0 figures.
    figure_left: f64,
    /// Right edge of column-1 figures (two-column mode only).
    figure_right: f64,
}

fn compute_layout(
    stacks: &[Vec<&Chromosome>],
    args: &Args,
    dataset_count: usize,
    has_cytobands: bool,
) -> Layout {
    let mut label_width = [0.0f64; 2];
    for stack in stacks {
        for (col, chromosome) in stack.iter().enumerate() {
            let w = chromosome.name.len() as f64 * TEXT_RATIO * args.text_size;
            if w > label_width[col] {
                label_width[col] = w;
            }
        }
    }

    let mut max_internal = 0.0f64;
    for stack in stacks {
        let mut w: f64 = stack.iter().map(|c| c.length as f64 / args.scale).sum();
        if stack.len() > 1 {
            w += args.column_gap;
        }
        if w > max_internal {
            max_internal = w;
        }
    }

    let mut width = max_internal + args.text_gap + label_width[0] + 2.0 * args.border;
    if label_width[1] > 0.0 {
        width += args.text_gap + label_width[1] + 2.0 * args.border;
    }

    let entry_height = dataset_count as f64 * (args.track_height + args.track_gap)
        + if has_cytobands {
            args.cytoband_height
        } else {
            args.bar_height
        };
    let height = if stacks.is_empty() {
        2.0 * args.border
    } else {
        stacks.len() as f64 * (entry_height + 2.0 * args.border + args.stack_gap) - args.stack_gap
    };

    let figure_left = 2.0 * args.border + label_width[0] + args.text_gap;
    let figure_right = width - (2.0 * args.border + label_width[1] + args.text_gap);

    Layout {
        width,
        height,
        label_width,
        entry_height,
        figure_left,
        figure_right,
    }
}

/// Deterministic per-dataset color from a SHA-256 of the label, normalized
/// and brightened so tracks stay readable on white.
fn label_color(label: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(label.as_bytes());
    let digest = hasher.finalize();

    let mut r = digest[24] as f32 / 255.0;
    let mut g = digest[8] as f32 / 255.0;
    let mut b = digest[16] as f32 / 255.0;

    // Normalize by sum
    let sum = r + g + b;
    if sum > 0.0 {
        r /= sum;
        g /= sum;
        b /= sum;
    }

    // Brighten toward full intensity without clipping the hue
    let max_component = r.max(g).max(b);
    let f = if max_component > 0.0 {
        1.5f32.min(1.0 / max_component)
    } else {
        1.0
    };

    (
        (255.0 * (r * f).min(1.0)).round() as u8,
        (255.0 * (g * f).min(1.0)).round() as u8,
        (255.0 * (b * f).min(1.0)).round() as u8,
    )
}

/// Escape special XML characters
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Minimal vector-drawing surface: rectangles, rounded clip regions, anchored
/// text and a lazily defined hatch pattern. Geometry arrives fully computed;
/// the canvas only turns it into markup.
struct SvgCanvas {
    body: String,
    defs: String,
    width: f64,
    height: f64,
    text_size: f64,
    clip_count: usize,
    hatch_defined: bool,
}

impl SvgCanvas {
    fn new(width: f64, height: f64, text_size: f64) -> Self {
        SvgCanvas {
            body: String::new(),
            defs: String::new(),
            width,
            height,
            text_size,
            clip_count: 0,
            hatch_defined: false,
        }
    }

    /// Rectangle with optional corner rounding, border, clip region and
    /// hover title.
    fn rect(
        &mut self,
        x: f64,
        y: f64,
        w: f64,
        h: f64,
        rx: f64,
        fill: &str,
        opacity: f64,
        stroke: Option<&str>,
        clip: Option<&str>,
        title: Option<&str>,
    ) {
        self.body.push_str(&format!(
            r#"<rect x="{:.2}" y="{:.2}" width="{:.2}" height="{:.2}""#,
            x, y, w, h
        ));
        if rx > 0.0 {
            self.body.push_str(&format!(r#" rx="{:.2}""#, rx));
        }
        self.body.push_str(&format!(r#" fill="{}""#, fill));
        if opacity < 1.0 {
            self.body
                .push_str(&format!(r#" fill-opacity="{:.2}""#, opacity));
        }
        if let Some(stroke) = stroke {
            self.body
                .push_str(&format!(r#" stroke="{}" stroke-width="0.75""#, stroke));
        }
        if let Some(clip) = clip {
            self.body.push_str(&format!(r#" clip-path="url(#{})""#, clip));
        }
        match title {
            Some(title) if !title.is_empty() => {
                self.body
                    .push_str(&format!("><title>{}</title></rect>\n", escape_xml(title)));
            }
            _ => self.body.push_str("/>\n"),
        }
    }

    /// Define a rounded-corner clip region and return its id.
    fn rounded_clip(&mut self, x: f64, y: f64, w: f64, h: f64, rx: f64) -> String {
        self.clip_count += 1;
        let id = format!("clip{}", self.clip_count);
        self.defs.push_str(&format!(
            r#"<clipPath id="{}"><rect x="{:.2}" y="{:.2}" width="{:.2}" height="{:.2}" rx="{:.2}"/></clipPath>"#,
            id, x, y, w, h, rx
        ));
        self.defs.push('\n');
        id
    }

    /// Repeating diagonal hatch, defined once on first use; returns the fill
    /// reference.
    fn hatch_fill(&mut self) -> &'static str {
        if !self.hatch_defined {
            self.defs.push_str(concat!(
                r##"<pattern id="hatch" width="4" height="4" patternUnits="userSpaceOnUse">"##,
                r##"<path d="M0,4 L4,0" stroke="black" stroke-width="0.8"/>"##,
                "</pattern>\n",
            ));
            self.hatch_defined = true;
        }
        "url(#hatch)"
    }

    fn text(&mut self, x: f64, y: f64, anchor: &str, content: &str) {
        self.body.push_str(&format!(
            r#"<text x="{:.2}" y="{:.2}" class="chrom-label" text-anchor="{}">{}</text>"#,
            x,
            y,
            anchor,
            escape_xml(content)
        ));
        self.body.push('\n');
    }

    /// Assemble the final self-contained document.
    fn finish(self) -> String {
        let mut svg = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<svg xmlns="http://www.w3.org/2000/svg" width="{:.2}" height="{:.2}" viewBox="0 0 {:.2} {:.2}">
<style>
  .chrom-label {{ font-family: 'DejaVu Sans Mono', 'Courier New', monospace; font-size: {}px; }}
</style>
"#,
            self.width, self.height, self.width, self.height, self.text_size
        );
        if !self.defs.is_empty() {
            svg.push_str("<defs>\n");
            svg.push_str(&self.defs);
            svg.push_str("</defs>\n");
        }
        svg.push_str("<rect width=\"100%\" height=\"100%\" fill=\"white\"/>\n");
        svg.push_str(&self.body);
        svg.push_str("</svg>\n");
        svg
    }
}

/// Draw one chromosome entry (density tracks, then ideogram or flat bar)
/// with its left edge at `x0` and the entry top at `y0`.
fn draw_entry(
    canvas: &mut SvgCanvas,
    chromosome: &Chromosome,
    x0: f64,
    y0: f64,
    track_labels: &[String],
    track_max: &[u64],
    args: &Args,
) {
    // Density tracks, one per dataset, top to bottom in load order. Runs of
    // adjacent bins with the same count collapse into a single rect.
    for (t, label) in track_labels.iter().enumerate() {
        let bins = match chromosome.data.get(label) {
            Some(bins) => bins,
            None => continue,
        };
        if track_max[t] == 0 {
            continue;
        }
        let track_y = y0 + t as f64 * (args.track_height + args.track_gap);
        let (r, g, b) = label_color(label);
        let fill = format!("rgb({},{},{})", r, g, b);
        let mut i = 0;
        while i < bins.len() {
            if bins[i] == 0 {
                i += 1;
                continue;
            }
            let run_start = i;
            let count = bins[i];
            while i < bins.len() && bins[i] == count {
                i += 1;
            }
            let opacity = count as f64 / track_max[t] as f64;
            canvas.rect(
                x0 + run_start as f64,
                track_y,
                (i - run_start) as f64,
                args.track_height,
                0.0,
                &fill,
                opacity,
                None,
                None,
                None,
            );
        }
    }

    let band_y = y0 + track_labels.len() as f64 * (args.track_height + args.track_gap);
    let arms = chromosome.arms();
    if arms.is_empty() {
        // No banding data: terminal flat-bar mode.
        canvas.rect(
            x0,
            band_y,
            chromosome.length as f64 / args.scale,
            args.bar_height,
            0.0,
            FLAT_BAR_FILL,
            1.0,
            Some("black"),
            None,
            None,
        );
        return;
    }

    let radius = args.cytoband_height / 2.0;
    for arm in &arms {
        if arm.end <= arm.start {
            continue;
        }
        let arm_x = x0 + arm.start as f64 / args.scale;
        let arm_w = (arm.end - arm.start) as f64 / args.scale;
        let clip = canvas.rounded_clip(arm_x, band_y, arm_w, args.cytoband_height, radius);
        for band in &chromosome.cytobands {
            if !band.span.overlaps(arm) {
                continue;
            }
            let paint = match band_paint(&band.stain) {
                Some(paint) => paint,
                None => continue,
            };
            let band_x = x0 + band.span.start as f64 / args.scale;
            let band_w = (band.span.end - band.span.start) as f64 / args.scale;
            // Hover title goes on the topmost rect of the band.
            let title = band.span.name.as_deref();
            if paint.opacity > 0.0 {
                canvas.rect(
                    band_x,
                    band_y,
                    band_w,
                    args.cytoband_height,
                    0.0,
                    "black",
                    paint.opacity,
                    None,
                    Some(&clip),
                    if paint.hatched { None } else { title },
                );
            }
            if paint.hatched {
                let hatch = canvas.hatch_fill();
                canvas.rect(
                    band_x,
                    band_y,
                    band_w,
                    args.cytoband_height,
                    0.0,
                    hatch,
                    1.0,
                    None,
                    Some(&clip),
                    title,
                );
            }
        }
        // Arm outline drawn last so band fills sit inside it.
        canvas.rect(
            arm_x,
            band_y,
            arm_w,
            args.cytoband_height,
            radius,
            "none",
            1.0,
            Some("black"),
            None,
            None,
        );
    }
}

/// Render every stack row into a finished SVG document.
fn render_svg(
    stacks: &[Vec<&Chromosome>],
    track_labels: &[String],
    layout: &Layout,
    args: &Args,
) -> String {
    let mut canvas = SvgCanvas::new(layout.width, layout.height, args.text_size);

    // Per-dataset maximum over every displayed chromosome, so one track's
    // shading is comparable between rows.
    let track_max: Vec<u64> = track_labels
        .iter()
        .map(|label| {
            stacks
                .iter()
                .flatten()
                .filter_map(|c| c.data.get(label))
                .flatten()
                .copied()
                .max()
                .unwrap_or(0)
        })
        .collect();

    let row_advance = layout.entry_height + 2.0 * args.border + args.stack_gap;
    for (row, stack) in stacks.iter().enumerate() {
        let row_y = row as f64 * row_advance + args.border;
        let label_y = row_y + layout.entry_height / 2.0 + args.text_size / 3.0;
        for (col, &chromosome) in stack.iter().enumerate() {
            let figure_w = chromosome.length as f64 / args.scale;
            let x0 = if col == 0 {
                layout.figure_left
            } else {
                // The second column is right-anchored; only the widest stack
                // gets exactly column_gap between its columns.
                layout.figure_right - figure_w
            };
            draw_entry(
                &mut canvas,
                chromosome,
                x0,
                row_y,
                track_labels,
                &track_max,
                args,
            );
            if col == 0 {
                canvas.text(
                    layout.figure_left - args.text_gap,
                    label_y,
                    "end",
                    &chromosome.name,
                );
            } else {
                canvas.text(
                    layout.figure_right + args.text_gap,
                    label_y,
                    "start",
                    &chromosome.name,
                );
            }
        }
    }

    canvas.finish()
}

fn main() {
    let args = Args::parse();

    // Initialize logger based on verbosity
    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    if args.sizes.is_none() && args.cytobands.is_none() && args.data.is_empty() {
        eprintln!("Error: nothing to draw. Provide a chrom.sizes file (-s), a cytoband file (-c) or at least one dataset (-d).");
        eprintln!("Run with --help for the full option list.");
        std::process::exit(1);
    }
    // The negated form also rejects NaN.
    if !(args.scale > 0.0) {
        eprintln!("Error: --scale must be a positive number of base pairs.");
        std::process::exit(1);
    }

    info!("Loading annotation...");
    let mut builder = KaryotypeBuilder::new();
    if let Some(path) = &args.sizes {
        if let Err(e) = parse_sizes_file(path, &mut builder) {
            eprintln!("Error loading sizes file: {}", e);
            std::process::exit(1);
        }
    }
    if let Some(path) = &args.cytobands {
        if let Err(e) = parse_cytobands_file(path, &mut builder) {
            eprintln!("Error loading cytoband file: {}", e);
            std::process::exit(1);
        }
    }
    info!("Annotated {} chromosomes", builder.chromosomes.len());

    // Dataset files are independent reads: parse them in parallel, join, then
    // bin them one after another onto the fully populated collection.
    let datasets = load_datasets(&args.data, &args.labels);
    let mut track_labels: Vec<String> = Vec::new();
    for (label, intervals) in &datasets {
        if !track_labels.contains(label) {
            track_labels.push(label.clone());
        }
        builder.rasterize(label, intervals, args.scale);
    }

    let karyotype = builder.finish();
    let has_cytobands = karyotype.has_cytobands();

    let filtered = filter_chromosomes(&karyotype, args.include_non_regular, args.include_mito);
    if filtered.is_empty() {
        warn!("No chromosomes left after filtering; the figure will be empty.");
    }
    info!(
        "Drawing {} chromosomes, {} tracks, {} layout",
        filtered.len(),
        track_labels.len(),
        if args.stacked { "stacked" } else { "single-column" }
    );

    let stacks = if args.stacked {
        stacked_chromosomes(&filtered)
    } else {
        single_stacks(&filtered)
    };
    let layout = compute_layout(&stacks, &args, track_labels.len(), has_cytobands);
    debug!(
        "canvas {:.1} x {:.1}, label gutters {:.1}/{:.1}, entry height {:.1}",
        layout.width,
        layout.height,
        layout.label_width[0],
        layout.label_width[1],
        layout.entry_height
    );

    let svg = render_svg(&stacks, &track_labels, &layout, &args);

    match &args.out {
        Some(path) => {
            info!("Saving to {:?}...", path);
            if let Err(e) = std::fs::write(path, &svg) {
                eprintln!("Error writing SVG: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            if let Err(e) = std::io::stdout().write_all(svg.as_bytes()) {
                eprintln!("Error writing SVG: {}", e);
                std::process::exit(1);
            }
        }
    }

    info!("Done.");
}
