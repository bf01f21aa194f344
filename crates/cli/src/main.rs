use anyhow::Context;
use clap::{Parser, Subcommand};
use influence::InfluenceMatrix;
use minimize::{MinimizeRequest, Session, SessionFailure};
use oracle::{HashOracle, OracleAdapter, Telemetry};
use prog::{serial, Target};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};
use syzmini::traits::{ExecBackend, ExecError, ExecSummary};
use syzmini::MappedSnapshot;

#[derive(Parser)]
#[command(name = "syzmini")]
#[command(about = "Influence-guided minimizer for syscall programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Minimize every serialized program in a directory.
    Minimize {
        /// JSON target description produced by the descriptions compiler.
        #[arg(long)]
        target: PathBuf,
        /// Directory of serialized programs named `<name>_<callindex>.json`.
        #[arg(long)]
        programs: PathBuf,
        /// Resume file of completed program indices; reopened append-only.
        #[arg(long)]
        out: PathBuf,
        /// First program index to process.
        #[arg(long, default_value_t = 0)]
        start_idx: usize,
        /// Percentage of static influence bits to keep (sensitivity studies).
        #[arg(long, default_value_t = 100)]
        influence_proportion: u8,
        /// Dithering seed; wall clock when omitted. Always logged.
        #[arg(long)]
        dither_seed: Option<u64>,
        /// rkyv influence snapshot, rebuilt and saved when absent or stale.
        #[arg(long)]
        influence_snapshot: Option<PathBuf>,
        /// Host executor command; run once per oracle attempt.
        #[arg(long)]
        executor: PathBuf,
        /// Treat the programs as crash reproducers.
        #[arg(long)]
        crash: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Minimize {
            target,
            programs,
            out,
            start_idx,
            influence_proportion,
            dither_seed,
            influence_snapshot,
            executor,
            crash,
        } => cmd_minimize(
            &target,
            &programs,
            &out,
            start_idx,
            influence_proportion,
            dither_seed,
            influence_snapshot.as_deref(),
            &executor,
            crash,
        ),
    }
}

// ---------------------------------------------------------------------------
// minimize
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn cmd_minimize(
    target_path: &Path,
    programs_dir: &Path,
    out_path: &Path,
    start_idx: usize,
    influence_proportion: u8,
    dither_seed: Option<u64>,
    snapshot_path: Option<&Path>,
    executor: &Path,
    crash: bool,
) -> anyhow::Result<()> {
    let target = load_target(target_path)?;
    let matrix = load_influence(&target, snapshot_path)?;
    tracing::info!(
        syscalls = target.syscalls.len(),
        influence_bits = matrix.count_ones(),
        "target loaded"
    );

    if influence_proportion < 100 {
        let seed = dither_seed.unwrap_or_else(wall_clock_seed);
        matrix.dither(influence_proportion, seed);
    }

    let done = read_resume(out_path)?;
    let mut resume = OpenOptions::new()
        .create(true)
        .append(true)
        .open(out_path)
        .with_context(|| format!("opening resume file {}", out_path.display()))?;

    let inputs = collect_programs(programs_dir)?;
    if inputs.is_empty() {
        println!("No programs found at: {}", programs_dir.display());
        return Ok(());
    }

    let mut minimized = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;
    let mut queries = 0u64;

    for (idx, (path, call_index)) in inputs.iter().enumerate() {
        if idx < start_idx || done.contains(&idx) {
            skipped += 1;
            continue;
        }

        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let program = match serial::deserialize(&bytes) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("warning: skipping {}: {}", path.display(), e);
                skipped += 1;
                continue;
            }
        };

        // The pre-minimization run pins the signal hash that defines
        // equivalence and seeds the learner's baseline telemetry.
        let mut backend = CommandBackend {
            executor: executor.to_path_buf(),
        };
        let baseline = backend
            .exec(&bytes, *call_index)
            .map_err(|e| anyhow::anyhow!("baseline execution of {}: {}", path.display(), e))?;
        let baseline_telemetry = if baseline.per_call_cov_hash.is_empty() {
            None
        } else {
            Some(Telemetry {
                per_call_cov_hash: baseline.per_call_cov_hash.clone(),
                execution_reached: baseline.completed,
            })
        };

        let adapter = OracleAdapter::new(
            &target,
            Box::new(HashOracle::new(backend, baseline.signal_hash)),
        );
        let session = Session::new(&target, adapter).with_influence(&matrix);
        let outcome = session.minimize(MinimizeRequest {
            program,
            call_index: *call_index,
            crash,
            baseline_telemetry,
        });
        queries += outcome.stats.total;

        match outcome.failure {
            None => {
                let min_path = minimized_path(path);
                let out_bytes = serial::serialize(&outcome.program)?;
                std::fs::write(&min_path, out_bytes)
                    .with_context(|| format!("writing {}", min_path.display()))?;
                writeln!(resume, "{}", idx)?;
                minimized += 1;
            }
            Some(SessionFailure::OracleInfrastructure) => {
                anyhow::bail!("oracle infrastructure failure on {}", path.display());
            }
            Some(kind) => {
                // The host proceeds with the un-minimized program.
                eprintln!("warning: {}: aborted with {:?}", path.display(), kind);
                writeln!(resume, "{}", idx)?;
                failed += 1;
            }
        }
    }

    println!("+------------------------------------------+");
    println!("| SYZMINI MINIMIZE                         |");
    println!("+------------------------------------------+");
    println!("| Programs       : {:>22} |", inputs.len());
    println!("| Minimized      : {:>22} |", minimized);
    println!("| Skipped        : {:>22} |", skipped);
    println!("| Aborted        : {:>22} |", failed);
    println!("| Oracle queries : {:>22} |", queries);
    println!("+------------------------------------------+");

    Ok(())
}

fn load_target(path: &Path) -> anyhow::Result<Target> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading target {}", path.display()))?;
    let target: Target = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing target {}", path.display()))?;
    target
        .finalize()
        .map_err(|e| anyhow::anyhow!("target description: {}", e))
}

fn load_influence(
    target: &Target,
    snapshot_path: Option<&Path>,
) -> anyhow::Result<InfluenceMatrix> {
    if let Some(path) = snapshot_path {
        if path.exists() {
            match MappedSnapshot::open(path).and_then(|m| m.to_owned()) {
                Ok(snap) => match InfluenceMatrix::from_snapshot(&snap, target) {
                    Ok(matrix) => {
                        tracing::info!(path = %path.display(), "influence snapshot loaded");
                        return Ok(matrix);
                    }
                    Err(e) => eprintln!("warning: stale influence snapshot: {}", e),
                },
                Err(e) => eprintln!("warning: could not open {}: {}", path.display(), e),
            }
        }
    }

    let matrix = InfluenceMatrix::analyze_static(target);
    if let Some(path) = snapshot_path {
        if let Err(e) = matrix.to_snapshot(target).save(path) {
            eprintln!("warning: could not save influence snapshot: {}", e);
        }
    }
    Ok(matrix)
}

fn wall_clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ---------------------------------------------------------------------------
// Program discovery and the resume file
// ---------------------------------------------------------------------------

/// Serialized programs, sorted by path for stable indices across runs. The
/// target-call index is encoded in the file name (`<name>_<callindex>.json`,
/// `-1` for crash-mode programs).
fn collect_programs(dir: &Path) -> anyhow::Result<Vec<(PathBuf, Option<usize>)>> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_file()
                && e.path().extension().and_then(|x| x.to_str()) == Some("json")
                && !e
                    .path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| s.ends_with(".min"))
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    files.sort();

    let mut out = Vec::new();
    for path in files {
        match call_index_from_name(&path) {
            Some(k) => out.push((path, k)),
            None => eprintln!(
                "warning: {}: no call index in file name, skipping",
                path.display()
            ),
        }
    }
    Ok(out)
}

/// `prog_3.json` -> `Some(Some(3))`; `prog_-1.json` -> `Some(None)`.
fn call_index_from_name(path: &Path) -> Option<Option<usize>> {
    let stem = path.file_stem()?.to_str()?;
    let raw = stem.split('_').nth(1)?;
    if raw == "-1" {
        return Some(None);
    }
    raw.parse::<usize>().ok().map(Some)
}

fn minimized_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("program");
    path.with_file_name(format!("{}.min.json", stem))
}

fn read_resume(path: &Path) -> anyhow::Result<HashSet<usize>> {
    let mut done = HashSet::new();
    if !path.exists() {
        return Ok(done);
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<usize>() {
            Ok(idx) => {
                done.insert(idx);
            }
            Err(_) => eprintln!("warning: resume file: bad line {:?}", line),
        }
    }
    Ok(done)
}

// ---------------------------------------------------------------------------
// Executor subprocess backend
// ---------------------------------------------------------------------------

/// Runs the host executor once per attempt: the serialized program goes to
/// stdin, the call index is the single argument (`-1` = none), and the last
/// stdout line reports `hash=<hex> cov=<hex,hex,...> completed=<0|1>`.
struct CommandBackend {
    executor: PathBuf,
}

impl ExecBackend for CommandBackend {
    fn exec(
        &mut self,
        program: &[u8],
        call_index: Option<usize>,
    ) -> Result<ExecSummary, ExecError> {
        let k = call_index.map(|k| k.to_string()).unwrap_or("-1".to_string());
        let mut child = Command::new(&self.executor)
            .arg(k)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ExecError::Infrastructure(format!("spawning executor: {}", e)))?;

        child
            .stdin
            .take()
            .ok_or_else(|| ExecError::Infrastructure("executor stdin unavailable".into()))?
            .write_all(program)
            .map_err(|e| ExecError::Infrastructure(format!("writing program: {}", e)))?;

        let output = child
            .wait_with_output()
            .map_err(|e| ExecError::Infrastructure(format!("waiting for executor: {}", e)))?;
        if !output.status.success() {
            return Err(ExecError::Infrastructure(format!(
                "executor exited with {}",
                output.status.code().unwrap_or(-1)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("");
        parse_summary(line)
    }
}

fn parse_summary(line: &str) -> Result<ExecSummary, ExecError> {
    let mut summary = ExecSummary::default();
    let mut saw_hash = false;
    for token in line.split_whitespace() {
        if let Some(v) = token.strip_prefix("hash=") {
            summary.signal_hash = parse_hex32(v)
                .ok_or_else(|| ExecError::Infrastructure(format!("bad hash {:?}", v)))?;
            saw_hash = true;
        } else if let Some(v) = token.strip_prefix("cov=") {
            for h in v.split(',').filter(|h| !h.is_empty()) {
                let hash = parse_hex32(h)
                    .ok_or_else(|| ExecError::Infrastructure(format!("bad cov hash {:?}", h)))?;
                summary.per_call_cov_hash.push(hash);
            }
        } else if let Some(v) = token.strip_prefix("completed=") {
            summary.completed = v == "1";
        }
    }
    if !saw_hash {
        return Err(ExecError::Infrastructure(format!(
            "executor summary missing hash: {:?}",
            line
        )));
    }
    Ok(summary)
}

fn parse_hex32(s: &str) -> Option<u32> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u32::from_str_radix(s, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_summary() {
        let s = parse_summary("hash=0xdead cov=1,2,beef completed=1").unwrap();
        assert_eq!(s.signal_hash, 0xdead);
        assert_eq!(s.per_call_cov_hash, vec![1, 2, 0xbeef]);
        assert!(s.completed);

        let s = parse_summary("hash=0 completed=0").unwrap();
        assert_eq!(s.signal_hash, 0);
        assert!(s.per_call_cov_hash.is_empty());
        assert!(!s.completed);

        assert!(parse_summary("cov=1,2").is_err());
        assert!(parse_summary("hash=xyz").is_err());
    }

    #[test]
    fn test_call_index_from_name() {
        assert_eq!(
            call_index_from_name(Path::new("/tmp/prog_3.json")),
            Some(Some(3))
        );
        assert_eq!(
            call_index_from_name(Path::new("/tmp/crash_-1.json")),
            Some(None)
        );
        assert_eq!(call_index_from_name(Path::new("/tmp/noindex.json")), None);
    }

    #[test]
    fn test_minimized_path() {
        assert_eq!(
            minimized_path(Path::new("/tmp/prog_3.json")),
            PathBuf::from("/tmp/prog_3.min.json")
        );
    }

    #[test]
    fn test_resume_roundtrip() {
        let tmp = std::env::temp_dir().join("test_syzmini_resume.txt");
        std::fs::write(&tmp, "0\n2\n\nnot-a-number\n5\n").unwrap();
        let done = read_resume(&tmp).unwrap();
        assert!(done.contains(&0) && done.contains(&2) && done.contains(&5));
        assert_eq!(done.len(), 3);
        std::fs::remove_file(tmp).ok();
    }
}
