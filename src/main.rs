//! # hr_version Stripper (hrvstrip)
//!
//! A CLI tool that removes `hr_version` definition blocks from Lua sources,
//! rewriting every matching file under a folder in place.
//!
//! ## Overview
//!
//! Mod data files often carry a low-resolution sprite definition with a nested
//! `hr_version` table holding the high-resolution one. `hrvstrip` deletes the
//! low-resolution fields, lifts the body of the `hr_version` table one level up
//! and drops the table itself. It works on indentation alone and never parses
//! Lua, so input must use a consistent 4-space indentation.
//!
//! ## Algorithm Flow
//!
//! ```text
//! Folder → Discovery (*.lua) → For each file:
//!                                - Read lines (terminators kept)
//!                                - Strip definition blocks
//!                                - Report decisions
//!                                - Overwrite (or diff / dry-run / JSON)
//! ```
//!
//! A trigger line (contains the marker, not commented, no `.`) rolls back the
//! already-emitted lines at its depth or deeper, then the lines after it are
//! classified until indentation drops below the trigger again.
//!
//! ## Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | General error (missing path, I/O error, config error) |
//! | 2 | Invalid command-line arguments |
//! | 3 | Dry-run mode: changes would be made |
//! | 4 | One or more files skipped as unsupported input |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use anyhow::{Context, Result};
use clap::Parser;
use clap::ValueEnum;
use clap::error::ErrorKind;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use rich_rust::terminal;
use rich_rust::{ColorSystem, Console};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

// ─────────────────────────────────────────────────────────────────────────────
// Exit Codes
// ─────────────────────────────────────────────────────────────────────────────

/// Semantic exit codes for scripting and CI integration
mod exit_codes {
    /// Success - completed without errors
    pub const SUCCESS: i32 = 0;
    /// General error (path not found, permission denied, I/O error)
    pub const ERROR: i32 = 1;
    /// Invalid command-line arguments
    pub const INVALID_ARGS: i32 = 2;
    /// Dry-run mode: changes would be made
    pub const WOULD_CHANGE: i32 = 3;
    /// At least one file was left untouched because its input is unsupported
    pub const UNSUPPORTED_INPUT: i32 = 4;
}

#[derive(Debug)]
struct ArgError(String);

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ArgError {}

/// Input the stripper refuses to touch: tabs, misaligned blocks, binary data
#[derive(Debug)]
struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug)]
struct RunOutcome {
    dry_run: bool,
    would_change: bool,
}

fn error_chain_has<T: std::error::Error + 'static>(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<T>())
}

fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    if error_chain_has::<ArgError>(err) {
        exit_codes::INVALID_ARGS
    } else if error_chain_has::<ParseError>(err) {
        exit_codes::UNSUPPORTED_INPUT
    } else {
        exit_codes::ERROR
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CLI Arguments
// ─────────────────────────────────────────────────────────────────────────────

/// Marker field whose definitions are removed
const DEFAULT_MARKER: &str = "hr_version";

/// File name patterns selected during the walk
const DEFAULT_GLOB: &str = "*.lua";

const DEFAULT_BACKUP_EXT: &str = ".bak";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ColorMode {
    /// Detect terminal support
    Auto,
    /// Always emit colors
    Always,
    /// Never emit colors
    Never,
}

/// hr_version stripper: removes hr_version definition blocks from Lua files in place
#[derive(Parser, Debug)]
#[command(
    name = "hrvstrip",
    version,
    about,
    long_about = None,
    after_help = "EXIT CODES:\n  0  Success\n  1  General error (path not found, I/O error, config error)\n  2  Invalid command-line arguments\n  3  Dry-run mode: changes would be made\n  4  One or more files skipped (tabs, unexpected indentation, binary or invalid UTF-8)\n"
)]
struct Args {
    /// Folder to scan recursively. Matching files are rewritten in place.
    #[arg(value_name = "FOLDER")]
    folder: PathBuf,

    /// Marker field whose definition blocks are removed
    #[arg(long, default_value = DEFAULT_MARKER)]
    marker: String,

    /// Glob pattern to match file names (comma-separated)
    #[arg(long, default_value = DEFAULT_GLOB)]
    glob: String,

    /// Respect .gitignore and .ignore files while walking
    #[arg(long)]
    gitignore: bool,

    /// Maximum directory depth (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_depth: usize,

    /// Preview changes without modifying files (exit 0=no changes, 3=would change)
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Show unified diff of each changed file
    #[arg(short = 'd', long)]
    diff: bool,

    /// Create backup file before overwriting
    #[arg(long, conflicts_with = "dry_run")]
    backup: bool,

    /// Extension for backup files (default: .bak)
    #[arg(long, default_value = DEFAULT_BACKUP_EXT, requires = "backup")]
    backup_ext: String,

    /// Path to config file (default: search for .hrvstriprc)
    #[arg(long = "config", value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Ignore config files
    #[arg(long = "no-config", conflicts_with = "config_file")]
    no_config: bool,

    /// Only report errors and files that could not be processed
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Color output: auto, always, or never
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorMode,

    /// Output one JSON report per file
    #[arg(long, conflicts_with_all = ["diff", "quiet"])]
    json: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Runtime configuration derived from CLI args and the config file
#[derive(Debug)]
struct Config {
    marker: String,
    glob: String,
    gitignore: bool,
    max_depth: usize,
    color: ColorMode,
    quiet: bool,
    diff: bool,
    dry_run: bool,
    backup: bool,
    backup_ext: String,
    json: bool,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            marker: args.marker.clone(),
            glob: args.glob.clone(),
            gitignore: args.gitignore,
            max_depth: args.max_depth,
            color: args.color,
            quiet: args.quiet,
            diff: args.diff,
            dry_run: args.dry_run,
            backup: args.backup,
            backup_ext: args.backup_ext.clone(),
            json: args.json,
        }
    }
}

impl Config {
    /// Progress lines and notes are printed unless quiet or in JSON mode
    fn reports_progress(&self) -> bool {
        !self.quiet && !self.json
    }
}

struct VerboseStyle {
    use_color: bool,
}

impl VerboseStyle {
    fn new(use_color: bool) -> Self {
        Self { use_color }
    }

    fn wrap(&self, tag: &str, text: impl fmt::Display) -> String {
        if self.use_color {
            format!("[{}]{}[/]", tag, text)
        } else {
            text.to_string()
        }
    }

    fn header(&self, text: impl fmt::Display) -> String {
        self.wrap("bold cyan", text)
    }

    fn removal(&self, text: impl fmt::Display) -> String {
        self.wrap("yellow", text)
    }

    fn success(&self, text: impl fmt::Display) -> String {
        self.wrap("bold green", text)
    }

    fn error(&self, text: impl fmt::Display) -> String {
        self.wrap("bold red", text)
    }

    fn dim(&self, text: impl fmt::Display) -> String {
        self.wrap("dim", text)
    }

    fn stat_label(&self, text: impl fmt::Display) -> String {
        self.wrap("bold blue", text)
    }

    fn separator(&self) -> String {
        self.wrap("dim", "───")
    }
}

/// Statistics collected while stripping
#[derive(Debug, Default, Clone)]
struct Stats {
    /// Definition triggers removed
    definitions_removed: usize,
    /// Marker lines left alone because they are commented out
    commented_skipped: usize,
    /// Marker lines left alone because they are member accesses
    references_skipped: usize,
    /// Lines dropped from the output (rollback, trigger and swallowed lines)
    lines_dropped: usize,
    /// Lines shifted left by one step
    lines_unindented: usize,
    /// Total number of lines read
    total_lines: usize,
    /// Processing elapsed time
    elapsed: Duration,
}

impl Stats {
    /// Merge another Stats into this one (for aggregating across files)
    fn merge(&mut self, other: &Stats) {
        self.definitions_removed += other.definitions_removed;
        self.commented_skipped += other.commented_skipped;
        self.references_skipped += other.references_skipped;
        self.lines_dropped += other.lines_dropped;
        self.lines_unindented += other.lines_unindented;
        self.total_lines += other.total_lines;
        self.elapsed += other.elapsed;
    }

    /// Calculate lines processed per second
    fn lines_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_lines as f64 / secs
        } else {
            self.total_lines as f64
        }
    }
}

/// File counters for the run summary
#[derive(Debug, Default)]
struct FileTally {
    processed: usize,
    changed: usize,
    skipped: usize,
}

/// Print a statistics summary
fn print_stats_summary(stats: &Stats, tally: &FileTally, console: &Console, styles: &VerboseStyle) {
    console.print("");
    console.print(&format!(
        "{} Summary {}",
        styles.separator(),
        styles.separator()
    ));

    console.print(&format!(
        "  {} {} processed, {} modified, {} unchanged, {} skipped",
        styles.stat_label("Files:"),
        tally.processed,
        tally.changed,
        tally.processed.saturating_sub(tally.changed),
        tally.skipped
    ));

    console.print(&format!(
        "  {} {} removed",
        styles.stat_label("Definitions:"),
        stats.definitions_removed
    ));

    console.print(&format!(
        "  {} {} dropped, {} unindented",
        styles.stat_label("Lines:"),
        stats.lines_dropped,
        stats.lines_unindented
    ));

    console.print(&format!(
        "  {} {} commented, {} references",
        styles.stat_label("Left alone:"),
        stats.commented_skipped,
        stats.references_skipped
    ));

    let elapsed_ms = stats.elapsed.as_secs_f64() * 1000.0;
    console.print(&format!(
        "  {} {:.2}ms ({:.0} lines/sec)",
        styles.stat_label("Time:"),
        elapsed_ms,
        stats.lines_per_second()
    ));

    console.print("");
}

fn build_console(color: ColorMode) -> (Console, VerboseStyle) {
    let no_color = std::env::var_os("NO_COLOR").is_some();
    let force = match color {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => !no_color && std::env::var_os("FORCE_COLOR").is_some(),
    };

    if force {
        let system = terminal::detect_color_system().unwrap_or(ColorSystem::Standard);
        let console = Console::builder()
            .force_terminal(true)
            .color_system(system)
            .build();
        return (console, VerboseStyle::new(true));
    }

    let console = Console::new();
    let use_color = color == ColorMode::Auto && !no_color && console.is_color_enabled();
    (console, VerboseStyle::new(use_color))
}

// ─────────────────────────────────────────────────────────────────────────────
// Config File Support
// ─────────────────────────────────────────────────────────────────────────────

/// Config file names searched in order
const CONFIG_FILENAMES: &[&str] = &[".hrvstriprc", ".hrvstriprc.toml", "hrvstriprc.toml"];

/// Configuration loaded from a .hrvstriprc file
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    /// Marker field whose definitions are removed
    marker: Option<String>,
    /// Glob patterns for file selection
    glob: Option<String>,
    /// Respect .gitignore
    gitignore: Option<bool>,
    /// Maximum directory depth
    max_depth: Option<usize>,
    /// Create backup before overwriting
    backup: Option<bool>,
    /// Backup file extension
    backup_ext: Option<String>,
    /// Color mode: auto, always, never
    color: Option<ColorMode>,
    /// Suppress progress output
    quiet: Option<bool>,
    /// Output as JSON
    json: Option<bool>,
}

/// Search for a config file starting from the given directory
fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();

    loop {
        for filename in CONFIG_FILENAMES {
            let config_path = current.join(filename);
            if config_path.is_file() {
                return Some(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    let home = dirs::home_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|filename| home.join(filename))
        .find(|path| path.is_file())
}

/// Load and parse a config file
fn load_config_file(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Create Config by merging file config with CLI args (CLI wins)
fn create_config(args: &Args) -> Result<Config> {
    let mut config = Config::from(args);

    if args.no_config {
        return Ok(config);
    }

    let config_path = if let Some(ref path) = args.config_file {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }
        Some(path.clone())
    } else {
        let start_dir = if args.folder.is_dir() {
            args.folder.clone()
        } else {
            args.folder
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
        };

        find_config_file(&start_dir)
    };

    let Some(path) = config_path else {
        return Ok(config);
    };
    let file_config = load_config_file(&path)?;

    // File values only apply where the CLI kept its default
    if args.marker == DEFAULT_MARKER {
        if let Some(marker) = file_config.marker {
            config.marker = marker;
        }
    }

    if args.glob == DEFAULT_GLOB {
        if let Some(glob) = file_config.glob {
            config.glob = glob;
        }
    }

    if !args.gitignore {
        if let Some(gi) = file_config.gitignore {
            config.gitignore = gi;
        }
    }

    if args.max_depth == 0 {
        if let Some(d) = file_config.max_depth {
            config.max_depth = d;
        }
    }

    if !args.backup && !args.dry_run {
        if let Some(b) = file_config.backup {
            config.backup = b;
        }
    }

    if args.backup_ext == DEFAULT_BACKUP_EXT {
        if let Some(ext) = file_config.backup_ext {
            config.backup_ext = ext;
        }
    }

    if args.color == ColorMode::Auto {
        if let Some(c) = file_config.color {
            config.color = c;
        }
    }

    if !args.quiet && !args.json {
        if let Some(q) = file_config.quiet {
            config.quiet = q;
        }
    }

    if !args.json && !args.diff && !args.quiet {
        if let Some(j) = file_config.json {
            config.json = j;
        }
    }

    Ok(config)
}

/// Reject settings that would make the run meaningless
fn validate_config(config: &Config) -> Result<()> {
    if config.marker.trim().is_empty() {
        return Err(ArgError("--marker must not be empty".to_string()).into());
    }

    if config.marker.chars().any(char::is_whitespace) {
        return Err(ArgError("--marker must not contain whitespace".to_string()).into());
    }

    if config.backup && config.backup_ext.is_empty() {
        return Err(ArgError("--backup-ext must not be empty".to_string()).into());
    }

    if config.json && config.quiet {
        return Err(ArgError("json and quiet output cannot be combined".to_string()).into());
    }

    build_globset(&config.glob)?;

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Block Removal
// ─────────────────────────────────────────────────────────────────────────────

/// Indentation removed from lines nested one level inside a stripped definition
const STEP: usize = 4;

/// Lua line comment start
const COMMENT_MARKER: &str = "--";

/// How a line is handled while a definition block is being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkippedLine {
    /// Body of the removed definition; kept, shifted left by [`STEP`]
    Unindent,
    /// One space deeper than the trigger, which no 4-space layout produces
    Misaligned,
    /// Opening brace, closing brace or sibling field of the removed definition
    Swallow,
    /// Indentation dropped below the trigger; the enclosing table closes here
    BlockEnd,
}

/// Classify a line inside a block being removed.
///
/// `trailing_delete` is set once the definition's own closing line has been
/// seen; from then on nothing is lifted out of the block.
fn classify_skipped_line(depth: usize, base: usize, trailing_delete: bool) -> SkippedLine {
    if depth >= base + STEP && !trailing_delete {
        SkippedLine::Unindent
    } else if depth == base + 1 {
        SkippedLine::Misaligned
    } else if depth >= base {
        SkippedLine::Swallow
    } else {
        SkippedLine::BlockEnd
    }
}

/// Leading whitespace width, not counting the line terminator
fn indent_depth(line: &str) -> usize {
    line.chars()
        .take_while(|c| c.is_whitespace() && *c != '\n' && *c != '\r')
        .count()
}

/// Decision recorded for a line containing the marker (1-indexed line numbers)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StripEvent {
    /// Definition trigger; its block was removed
    Removed { line: usize },
    /// Marker inside a comment, left in place
    Commented { line: usize },
    /// Member access such as `sprite.hr_version`, left in place
    Reference { line: usize },
}

/// Reason a file cannot be stripped safely (1-indexed line numbers)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndentError {
    Tab { line: usize },
    Misaligned { line: usize },
}

impl IndentError {
    fn describe(&self, filename: &str) -> String {
        match self {
            IndentError::Tab { line } => format!(
                "Tab found in {}:{}, please use spaces for indentation",
                filename, line
            ),
            IndentError::Misaligned { line } => {
                format!("Unexpected indentation level in {}:{}", filename, line)
            }
        }
    }
}

/// Abort of a strip pass, with the decisions taken before the bad line
#[derive(Debug)]
struct StripFailure {
    error: IndentError,
    events: Vec<StripEvent>,
}

/// Stripped lines plus what happened along the way
#[derive(Debug)]
struct StripOutcome {
    lines: Vec<String>,
    events: Vec<StripEvent>,
    lines_unindented: usize,
}

impl StripOutcome {
    fn stats(&self, total_lines: usize) -> Stats {
        let mut stats = Stats {
            lines_dropped: total_lines.saturating_sub(self.lines.len()),
            lines_unindented: self.lines_unindented,
            total_lines,
            ..Stats::default()
        };

        for event in &self.events {
            match event {
                StripEvent::Removed { .. } => stats.definitions_removed += 1,
                StripEvent::Commented { .. } => stats.commented_skipped += 1,
                StripEvent::Reference { .. } => stats.references_skipped += 1,
            }
        }

        stats
    }
}

/// Remove every definition block introduced by `marker`.
///
/// Lines keep their terminators, so joining the output reproduces the file
/// byte for byte wherever nothing was removed. Fails without partial output
/// on the first tab or misaligned line.
fn strip_definitions(lines: &[String], marker: &str) -> Result<StripOutcome, StripFailure> {
    let mut output: Vec<String> = Vec::with_capacity(lines.len());
    let mut events = Vec::new();
    let mut lines_unindented = 0;

    let mut skip_block = false;
    let mut trailing_delete = false;
    let mut base = 0;

    for (idx, line) in lines.iter().enumerate() {
        let line_no = idx + 1;

        if line.contains('\t') {
            return Err(StripFailure {
                error: IndentError::Tab { line: line_no },
                events,
            });
        }

        let content = line.trim_start();
        if content.is_empty() {
            output.push(line.clone());
            continue;
        }

        if content.contains(marker) {
            if content.contains(COMMENT_MARKER) {
                events.push(StripEvent::Commented { line: line_no });
                output.push(line.clone());
                continue;
            }
            if content.contains('.') {
                events.push(StripEvent::Reference { line: line_no });
                output.push(line.clone());
                continue;
            }

            events.push(StripEvent::Removed { line: line_no });
            base = indent_depth(line);
            skip_block = true;
            trailing_delete = false;

            // Block rollback: the low-resolution fields sit at the trigger's depth
            while output.last().is_some_and(|prev| indent_depth(prev) >= base) {
                output.pop();
            }
            continue;
        }

        if !skip_block {
            output.push(line.clone());
            continue;
        }

        let depth = indent_depth(line);
        match classify_skipped_line(depth, base, trailing_delete) {
            SkippedLine::Unindent => {
                output.push(format!("{}{}", " ".repeat(depth - STEP), content));
                lines_unindented += 1;
            }
            SkippedLine::Misaligned => {
                return Err(StripFailure {
                    error: IndentError::Misaligned { line: line_no },
                    events,
                });
            }
            SkippedLine::Swallow => {
                if !content.contains('{') {
                    trailing_delete = true;
                }
            }
            SkippedLine::BlockEnd => {
                skip_block = false;
                trailing_delete = false;
                output.push(line.clone());
            }
        }
    }

    Ok(StripOutcome {
        lines: output,
        events,
        lines_unindented,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Recursive File Discovery
// ─────────────────────────────────────────────────────────────────────────────

fn build_globset(patterns: &str) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    let mut added = 0;

    for raw in patterns.split(',') {
        let pattern = raw.trim();
        if pattern.is_empty() {
            continue;
        }

        let glob = Glob::new(pattern)
            .map_err(|err| ArgError(format!("Invalid glob pattern '{}': {}", pattern, err)))?;
        builder.add(glob);
        added += 1;
    }

    if added == 0 {
        return Err(ArgError("--glob must include at least one pattern".to_string()).into());
    }

    builder
        .build()
        .map_err(|err| ArgError(format!("Invalid glob set: {}", err)).into())
}

/// Files selected by the walk, plus the walk errors met on the way
#[derive(Debug, Default)]
struct Discovery {
    files: Vec<PathBuf>,
    walk_errors: Vec<String>,
}

fn discover_files(root: &Path, config: &Config) -> Result<Discovery> {
    let globs = build_globset(&config.glob)?;
    let matches = |path: &Path| path.file_name().is_some_and(|name| globs.is_match(name));

    if root.is_file() {
        let files = if matches(root) {
            vec![root.to_path_buf()]
        } else {
            Vec::new()
        };
        return Ok(Discovery {
            files,
            walk_errors: Vec::new(),
        });
    }

    if !root.is_dir() {
        anyhow::bail!("Path does not exist: {}", root.display());
    }

    let mut walker = WalkBuilder::new(root);
    walker.git_ignore(config.gitignore);
    walker.git_exclude(config.gitignore);
    walker.git_global(config.gitignore);
    walker.ignore(config.gitignore);
    walker.parents(config.gitignore);
    walker.hidden(false);

    if config.max_depth > 0 {
        walker.max_depth(Some(config.max_depth));
    }

    let mut files = BTreeSet::new();
    let mut walk_errors = Vec::new();

    for entry in walker.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                walk_errors.push(err.to_string());
                continue;
            }
        };

        // Directory links stay unfollowed; a link to a file rewrites its target
        let is_file = entry
            .file_type()
            .is_some_and(|ft| ft.is_file() || (ft.is_symlink() && entry.path().is_file()));
        if is_file && matches(entry.path()) {
            files.insert(entry.path().to_path_buf());
        }
    }

    Ok(Discovery {
        files: files.into_iter().collect(),
        walk_errors,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// File I/O
// ─────────────────────────────────────────────────────────────────────────────

/// Sibling path used for a backup: `item.lua` with `.bak` becomes `item.lua.bak`
fn backup_path(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(ext);
    PathBuf::from(name)
}

fn create_backup(path: &Path, ext: &str) -> Result<PathBuf> {
    let target = backup_path(path, ext);
    fs::copy(path, &target).with_context(|| {
        format!("Could not back up {} to {}", path.display(), target.display())
    })?;
    Ok(target)
}

/// Largest source accepted (100 MB); anything bigger is not a hand-written Lua file
const MAX_SOURCE_BYTES: u64 = 100 * 1024 * 1024;

/// Read a source file into lines, terminators included
fn read_file(path: &Path) -> Result<Vec<String>> {
    let size = fs::metadata(path)
        .with_context(|| format!("Could not stat {}", path.display()))?
        .len();

    if size > MAX_SOURCE_BYTES {
        return Err(ParseError(format!(
            "{} is {} MB, over the {} MB limit",
            path.display(),
            size >> 20,
            MAX_SOURCE_BYTES >> 20
        ))
        .into());
    }

    let bytes = fs::read(path).with_context(|| format!("Could not read {}", path.display()))?;
    split_source(bytes, &path.display().to_string())
}

/// Decode a source as UTF-8 and split it after every `\n`
fn split_source(bytes: Vec<u8>, label: &str) -> Result<Vec<String>> {
    if let Some(offset) = bytes.iter().position(|&b| b == 0) {
        return Err(ParseError(format!(
            "{} looks binary (NUL byte at offset {})",
            label, offset
        ))
        .into());
    }

    let text = String::from_utf8(bytes).map_err(|err| {
        let offset = err.utf8_error().valid_up_to();
        ParseError(format!(
            "{} is not valid UTF-8: byte 0x{:02X} at offset {}",
            label,
            err.as_bytes()[offset],
            offset
        ))
    })?;

    Ok(text.split_inclusive('\n').map(String::from).collect())
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON Output Structures
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct JsonOutput {
    version: &'static str,
    status: &'static str,
    file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<InputStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    processing: Option<ProcessingStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<OutputStats>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    events: Vec<JsonEvent>,
}

#[derive(Serialize)]
struct InputStats {
    lines: usize,
    bytes: usize,
}

#[derive(Serialize)]
struct ProcessingStats {
    definitions_removed: usize,
    lines_dropped: usize,
    lines_unindented: usize,
}

#[derive(Serialize)]
struct OutputStats {
    lines: usize,
    bytes: usize,
    changed: bool,
}

#[derive(Serialize)]
struct JsonEvent {
    line: usize,
    action: &'static str,
}

impl From<&StripEvent> for JsonEvent {
    fn from(event: &StripEvent) -> Self {
        match *event {
            StripEvent::Removed { line } => JsonEvent {
                line,
                action: "removed",
            },
            StripEvent::Commented { line } => JsonEvent {
                line,
                action: "commented",
            },
            StripEvent::Reference { line } => JsonEvent {
                line,
                action: "reference",
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry Point
// ─────────────────────────────────────────────────────────────────────────────

/// Result of stripping a single file
struct FileResult {
    filename: String,
    original: Vec<String>,
    stripped: Vec<String>,
    events: Vec<StripEvent>,
    stats: Stats,
    would_change: bool,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit_codes::SUCCESS,
                _ => exit_codes::INVALID_ARGS,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    let exit_code = match run(args) {
        Ok(outcome) => {
            if outcome.dry_run && outcome.would_change {
                exit_codes::WOULD_CHANGE
            } else {
                exit_codes::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("Error: {:#}", err);
            exit_code_for_error(&err)
        }
    };

    std::process::exit(exit_code);
}

/// Read and strip one file, reporting each marker decision. Nothing is written here.
///
/// On an abort the decisions reached before the offending line are still
/// reported, followed by the error.
fn process_file(
    path: &Path,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<FileResult> {
    let filename = path.display().to_string();
    let original = read_file(path)?;

    let start = Instant::now();
    let outcome = match strip_definitions(&original, &config.marker) {
        Ok(outcome) => outcome,
        Err(failure) => {
            if config.reports_progress() {
                report_events(&filename, &failure.events, &config.marker, console, styles);
            }
            return Err(ParseError(failure.error.describe(&filename)).into());
        }
    };
    let mut stats = outcome.stats(original.len());
    stats.elapsed = start.elapsed();

    if config.reports_progress() {
        report_events(&filename, &outcome.events, &config.marker, console, styles);
    }

    let would_change = outcome.lines != original;

    Ok(FileResult {
        filename,
        original,
        stripped: outcome.lines,
        events: outcome.events,
        stats,
        would_change,
    })
}

fn event_message(event: &StripEvent, filename: &str, marker: &str) -> String {
    match *event {
        StripEvent::Removed { line } => {
            format!("Removing {} from {}:{}", marker, filename, line)
        }
        StripEvent::Commented { line } => format!(
            "Commented out {} found in {}:{}. Skipping",
            marker, filename, line
        ),
        StripEvent::Reference { line } => format!(
            "Non-definition reference to {} found in {}:{}. Skipping",
            marker, filename, line
        ),
    }
}

/// Print one console line per marker decision
fn report_events(
    filename: &str,
    events: &[StripEvent],
    marker: &str,
    console: &Console,
    styles: &VerboseStyle,
) {
    for event in events {
        let message = event_message(event, filename, marker);
        let styled = match event {
            StripEvent::Removed { .. } => styles.removal(message),
            _ => styles.dim(message),
        };
        console.print(&styled);
    }
}

/// Overwrite the file with its stripped lines, backing it up first if asked
fn write_result(
    path: &Path,
    result: &FileResult,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<()> {
    if config.backup {
        let backup_path = create_backup(path, &config.backup_ext)?;
        if config.reports_progress() {
            console.print(&styles.dim(format!("Created backup: {}", backup_path.display())));
        }
    }

    fs::write(path, result.stripped.concat())
        .with_context(|| format!("Failed to write to file: {}", path.display()))
}

/// Unified diff between the file on disk and its stripped form
fn render_diff(result: &FileResult, proposed: bool) -> String {
    let before = result.original.concat();
    let after = result.stripped.concat();
    let old_label = format!("a/{}", result.filename);
    let new_label = if proposed {
        format!("b/{} (proposed)", result.filename)
    } else {
        format!("b/{}", result.filename)
    };

    let rendered = TextDiff::from_lines(&before, &after)
        .unified_diff()
        .context_radius(3)
        .header(&old_label, &new_label)
        .to_string();
    rendered
}

fn json_status(config: &Config, result: &FileResult) -> &'static str {
    match (result.would_change, config.dry_run) {
        (false, _) => "unchanged",
        (true, true) => "would_modify",
        (true, false) => "modified",
    }
}

fn json_for_result(config: &Config, result: &FileResult) -> JsonOutput {
    let stripped_bytes: usize = result.stripped.iter().map(String::len).sum();

    JsonOutput {
        version: "1.0",
        status: json_status(config, result),
        file: result.filename.clone(),
        error: None,
        input: Some(InputStats {
            lines: result.original.len(),
            bytes: result.original.iter().map(String::len).sum(),
        }),
        processing: Some(ProcessingStats {
            definitions_removed: result.stats.definitions_removed,
            lines_dropped: result.stats.lines_dropped,
            lines_unindented: result.stats.lines_unindented,
        }),
        output: Some(OutputStats {
            lines: result.stripped.len(),
            bytes: stripped_bytes,
            changed: result.would_change,
        }),
        events: result.events.iter().map(JsonEvent::from).collect(),
    }
}

/// Report for a path that produced no stripped output
fn json_failure(status: &'static str, file: &Path, error: String) -> JsonOutput {
    JsonOutput {
        version: "1.0",
        status,
        file: file.display().to_string(),
        error: Some(error),
        input: None,
        processing: None,
        output: None,
        events: Vec::new(),
    }
}

fn json_for_error(path: &Path, err: &anyhow::Error) -> JsonOutput {
    json_failure("skipped", path, format!("{:#}", err))
}

fn json_for_walk_error(root: &Path, message: &str) -> JsonOutput {
    json_failure("walk_error", root, message.to_string())
}

fn print_json(output: &JsonOutput) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(output).context("Failed to serialize JSON output")?
    );
    Ok(())
}

/// Strip, report and write one file
fn handle_file(
    path: &Path,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<FileResult> {
    if config.reports_progress() {
        console.print(&styles.header(format!("Processing file: {}", path.display())));
    }

    let result = process_file(path, config, console, styles)?;

    if config.diff && result.would_change {
        io::stdout()
            .lock()
            .write_all(render_diff(&result, config.dry_run).as_bytes())
            .context("Failed to write diff")?;
    }

    if !result.would_change {
        return Ok(result);
    }

    if config.dry_run {
        if config.reports_progress() {
            console.print(&styles.removal(format!("Would modify: {}", result.filename)));
        }
    } else {
        write_result(path, &result, config, console, styles)?;
        if config.reports_progress() {
            console.print(&styles.success(format!(
                "{}: {} definition(s) removed",
                result.filename, result.stats.definitions_removed
            )));
        }
    }

    Ok(result)
}

/// Turn the failures collected during a run into its final error.
///
/// Exit 4 applies only when every problem was unsupported input; any I/O or
/// walk error makes the run a general failure.
fn run_failure(
    errors: &[(PathBuf, anyhow::Error)],
    walk_errors: &[String],
    root: &Path,
) -> Result<()> {
    if !errors.is_empty() {
        let files = errors
            .iter()
            .map(|(p, _)| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let all_unsupported = errors
            .iter()
            .all(|(_, err)| error_chain_has::<ParseError>(err));

        if all_unsupported && walk_errors.is_empty() {
            return Err(ParseError(format!(
                "{} file(s) left unmodified: {}",
                errors.len(),
                files
            ))
            .into());
        }

        anyhow::bail!(
            "{} file(s) had errors, {} path(s) could not be walked: {}",
            errors.len(),
            walk_errors.len(),
            files
        );
    }

    if !walk_errors.is_empty() {
        anyhow::bail!(
            "{} path(s) could not be walked under {}",
            walk_errors.len(),
            root.display()
        );
    }

    Ok(())
}

fn run(args: Args) -> Result<RunOutcome> {
    let config = create_config(&args)?;
    validate_config(&config)?;
    let (console, styles) = build_console(config.color);

    let discovery = discover_files(&args.folder, &config)?;
    for warning in &discovery.walk_errors {
        if config.json {
            print_json(&json_for_walk_error(&args.folder, warning))?;
        } else {
            console.print(&styles.error(format!("Warning: {}", warning)));
        }
    }

    if discovery.files.is_empty() && config.reports_progress() {
        console.print(&styles.dim(format!(
            "No files matched pattern '{}' in {}",
            config.glob,
            args.folder.display()
        )));
    }

    let mut tally = FileTally::default();
    let mut aggregated_stats = Stats::default();
    let mut any_would_change = false;
    let mut errors: Vec<(PathBuf, anyhow::Error)> = Vec::new();

    for path in &discovery.files {
        match handle_file(path, &config, &console, &styles) {
            Ok(result) => {
                tally.processed += 1;
                if result.would_change {
                    tally.changed += 1;
                    any_would_change = true;
                }
                aggregated_stats.merge(&result.stats);

                if config.json {
                    print_json(&json_for_result(&config, &result))?;
                }
            }
            Err(err) => {
                tally.skipped += 1;
                if config.json {
                    print_json(&json_for_error(path, &err))?;
                } else {
                    console.print(&styles.error(format!("{:#}", err)));
                }
                errors.push((path.clone(), err));
            }
        }
    }

    if config.reports_progress() {
        print_stats_summary(&aggregated_stats, &tally, &console, &styles);
    }

    run_failure(&errors, &discovery.walk_errors, &args.folder)?;

    Ok(RunOutcome {
        dry_run: config.dry_run,
        would_change: any_would_change,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
