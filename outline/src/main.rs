use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use outline::core::{Outline, Selection};
use outline::storage::OutlineParser;
use outline::{
    ChangeOutcome, CommitHook, NomOutlineParser, OutlineConfig, Session, format_outline,
    line_targets,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const EXTENSIONS: &[&str] = &["outline", "txt"];

#[derive(Debug, Parser)]
#[command(
    name = "outline",
    about = "Structural editing for hierarchical outlines",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse outline files and print their structure.
    Parse(ParseArgs),

    /// Validate the tree invariants of outline files.
    Check(CheckArgs),

    /// Render outline files in canonical form.
    Format(FormatArgs),

    /// Change the heading level of the content at a line (range).
    Level(LevelArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Outline files or directories containing outline files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// JSON config file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct FormatArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct LevelArgs {
    /// Outline file to edit.
    input: PathBuf,
    /// 1-based line of the selection anchor, in canonical formatting.
    #[arg(long)]
    line: usize,
    /// 1-based line of the selection head; defaults to `--line`.
    #[arg(long)]
    to_line: Option<usize>,
    /// Requested heading level.
    #[arg(long)]
    level: u8,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
    /// Emit the outcome as JSON.
    #[arg(long)]
    json: bool,
    /// JSON config file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Parse(args) => handle_parse(args),
        Commands::Check(args) => handle_check(args),
        Commands::Format(args) => handle_format(args),
        Commands::Level(args) => handle_level(args),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<OutlineConfig> {
    match path {
        Some(path) => OutlineConfig::load(path),
        None => Ok(OutlineConfig::default()),
    }
}

fn parse_all(inputs: &[PathBuf]) -> Result<Vec<(PathBuf, Outline)>> {
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        bail!("no outline files found in the provided inputs");
    }
    let parser = NomOutlineParser;
    expanded
        .into_iter()
        .map(|path| {
            debug!(?path, "parsing");
            let outline = parser.parse_file(&path)?;
            Ok((path, outline))
        })
        .collect()
}

fn handle_parse(args: ParseArgs) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let parsed = parse_all(&inputs)?;

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            outline: &'a Outline,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, outline)| JsonOutput {
                path: path.display().to_string(),
                outline,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, outline)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            println!("{:#?}", outline);
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_check(args: CheckArgs) -> Result<()> {
    let CheckArgs { inputs, config } = args;
    let config = load_config(config.as_deref())?;
    let parsed = parse_all(&inputs)?;

    let mut failures = 0;
    for (path, outline) in &parsed {
        match outline.validate(config.max_level) {
            Ok(()) => println!("ok    {}", path.display()),
            Err(violation) => {
                failures += 1;
                println!("FAIL  {}: {}", path.display(), violation);
            }
        }
    }
    if failures > 0 {
        bail!("{} of {} outline(s) violate the tree invariants", failures, parsed.len());
    }
    Ok(())
}

fn handle_format(args: FormatArgs) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    let parsed = parse_all(&inputs)?;
    let many = parsed.len() > 1;

    for (idx, (path, outline)) in parsed.iter().enumerate() {
        let formatted = format_outline(outline);
        if in_place {
            fs::write(path, formatted.as_bytes())
                .with_context(|| format!("writing {:?}", path))?;
            info!(?path, "formatted in place");
        } else {
            if many {
                if idx > 0 {
                    println!();
                }
                println!("== {} ==", path.display());
            }
            print!("{formatted}");
        }
    }
    Ok(())
}

/// Writes every accepted edit back to the source file.
struct FileCommit {
    path: PathBuf,
}

impl CommitHook for FileCommit {
    fn commit(&mut self, outline: &Outline, _selection: &Selection) -> Result<()> {
        fs::write(&self.path, format_outline(outline).as_bytes())
            .with_context(|| format!("writing {:?}", self.path))
    }
}

/// Prints accepted edits instead of persisting them.
struct PrintCommit {
    quiet: bool,
}

impl CommitHook for PrintCommit {
    fn commit(&mut self, outline: &Outline, _selection: &Selection) -> Result<()> {
        if !self.quiet {
            print!("{}", format_outline(outline));
        }
        Ok(())
    }
}

fn handle_level(args: LevelArgs) -> Result<()> {
    let LevelArgs {
        input,
        line,
        to_line,
        level,
        in_place,
        json,
        config,
    } = args;
    let config = load_config(config.as_deref())?;
    let outline = NomOutlineParser.parse_file(&input)?;

    let targets = line_targets(&outline);
    let target = |n: usize| {
        n.checked_sub(1)
            .and_then(|i| targets.get(i).copied())
            .with_context(|| format!("line {} is outside 1..={}", n, targets.len()))
    };
    let selection = Selection::new(target(line)?, target(to_line.unwrap_or(line))?);

    let outcome = if in_place {
        let hook = FileCommit {
            path: input.clone(),
        };
        Session::new(config, outline, selection, hook).change_heading_level(level)?
    } else {
        let hook = PrintCommit { quiet: json };
        Session::new(config, outline, selection, hook).change_heading_level(level)?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    match outcome {
        ChangeOutcome::Applied { .. } => {
            if in_place {
                info!(path = ?input, level, "level changed in place");
            }
            Ok(())
        }
        ChangeOutcome::Rejected(rejection) => {
            bail!("level change rejected ({}): {}", rejection.reason(), rejection)
        }
    }
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(dir = ?canonical, "scanning directory");
            for file in collect_outline_files(&canonical)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !has_outline_extension(&canonical) {
                bail!("{:?} is not an outline file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn has_outline_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| EXTENSIONS.contains(&ext))
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && has_outline_extension(&canonical) {
        out.push(canonical);
    }
    Ok(())
}

fn collect_outline_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(root, &mut out, &mut visited)?;
    out.sort();
    Ok(out)
}
