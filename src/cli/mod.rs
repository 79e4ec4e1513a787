//! CLI argument parsing
//!
//! Pabot-specific flags come first on the command line; everything after
//! them is handed to the underlying runner untouched, with the trailing
//! non-option arguments treated as the datasources.
//!
//! Two shapes clap cannot express are peeled off in a pre-pass:
//! `--command ... --end-command` spans and numbered `--argumentfileN`
//! flags.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use regex::Regex;

/// Pabot command line surface (runner flags excluded).
#[derive(Parser, Debug)]
#[command(name = "pabot")]
#[command(version)]
#[command(about = "A parallel executor for test corpora")]
#[command(long_about = None)]
pub struct Args {
    /// More output, including captured stdout/stderr of failed units
    #[arg(long)]
    pub verbose: bool,

    /// Split execution at test level instead of suite level
    #[arg(long)]
    pub testlevelsplit: bool,

    /// Number of parallel workers, or "all" for one per unit
    #[arg(long, value_name = "N|all")]
    pub processes: Option<String>,

    /// Start the coordination server (on by default)
    #[arg(long)]
    pub pabotlib: bool,

    /// Do not start the coordination server
    #[arg(long = "no-pabotlib")]
    pub no_pabotlib: bool,

    /// Coordination server bind host
    #[arg(long, default_value = "127.0.0.1", value_name = "HOST")]
    pub pabotlibhost: String,

    /// Coordination server port (0 picks a free port)
    #[arg(long, default_value_t = 8270, value_name = "PORT")]
    pub pabotlibport: u16,

    /// Kill a worker subprocess after this many seconds
    #[arg(long, value_name = "SECONDS")]
    pub processtimeout: Option<u64>,

    /// Run only the I-th of N equal slices of the plan, as I/N
    #[arg(long, value_name = "I/N")]
    pub shard: Option<String>,

    /// Artifact file extensions to copy into the output directory
    #[arg(long, value_delimiter = ',', default_value = "png", value_name = "EXT,...")]
    pub artifacts: Vec<String>,

    /// Also collect artifacts from subfolders of unit output directories
    #[arg(long)]
    pub artifactsinsubfolders: bool,

    /// Value-set resource file for the coordination server
    #[arg(long, value_name = "PATH")]
    pub resourcefile: Option<PathBuf>,

    /// Order units by a previous result file: failed first, then slowest
    #[arg(long, value_name = "OUTPUT.XML")]
    pub suitesfrom: Option<PathBuf>,

    /// Ordering file with #WAIT / #SLEEP / #DEPENDS / group annotations
    #[arg(long, value_name = "PATH")]
    pub ordering: Option<PathBuf>,

    /// Pack units into at most one sequential group per worker
    #[arg(long)]
    pub chunk: bool,

    /// Pre-run modifier passed to the runner during discovery
    #[arg(long, value_name = "MODIFIER")]
    pub pabotprerunmodifier: Option<String>,

    /// Leave per-unit outputs in place and skip merging
    #[arg(long = "no-rebot")]
    pub no_rebot: bool,
}

/// Everything the rest of the program needs to know about one invocation.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Base runner invocation (`robot` unless `--command` was given).
    pub command: Vec<String>,
    pub verbose: bool,
    pub testlevelsplit: bool,
    /// `None` means "all": one worker slot per unit.
    pub processes: Option<usize>,
    pub pabotlib: bool,
    pub pabotlibhost: String,
    pub pabotlibport: u16,
    pub processtimeout: Option<Duration>,
    pub shard: Option<(usize, usize)>,
    pub artifacts: Vec<String>,
    pub artifactsinsubfolders: bool,
    pub resourcefile: Option<PathBuf>,
    pub suitesfrom: Option<PathBuf>,
    pub ordering: Option<PathBuf>,
    pub chunk: bool,
    pub prerunmodifier: Option<String>,
    pub no_rebot: bool,
    /// Numbered argument files, in flag order: (index digits, path).
    pub argumentfiles: Vec<(String, PathBuf)>,
    /// Runner options passed through verbatim.
    pub runner_args: Vec<String>,
    /// Trailing non-option arguments.
    pub datasources: Vec<PathBuf>,
}

impl Settings {
    /// Worker pool size for a plan of `dispatch_count` units.
    pub fn worker_budget(&self, dispatch_count: usize) -> usize {
        let budget = match self.processes {
            Some(n) => n,
            None => dispatch_count,
        };
        budget.max(1)
    }

    /// Default worker budget when `--processes` is absent.
    fn default_processes() -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cpus.min(2)
    }

    /// The runner-native output directory (`--outputdir`, default `.`).
    pub fn outputdir(&self) -> PathBuf {
        let mut iter = self.runner_args.iter();
        let mut found = None;
        while let Some(arg) = iter.next() {
            if arg == "--outputdir" || arg == "-d" {
                found = iter.next().cloned();
            }
        }
        found.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
    }

    /// Scratch directory for per-unit outputs.
    pub fn results_dir(&self) -> PathBuf {
        self.outputdir().join("pabot_results")
    }
}

/// Parse the full argv (without the program name) into [`Settings`].
pub fn parse_cli<I, S>(argv: I) -> Result<Settings>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
    let (command, argv) = extract_command_span(argv)?;
    let (argumentfiles, argv) = extract_argumentfiles(argv)?;
    let (pabot_argv, rest) = split_pabot_flags(argv);

    let mut clap_argv = vec!["pabot".to_string()];
    clap_argv.extend(pabot_argv);
    let args = Args::try_parse_from(&clap_argv)?;

    if args.pabotlib && args.no_pabotlib {
        bail!("cannot use both --pabotlib and --no-pabotlib");
    }

    let processes = match args.processes.as_deref() {
        None => Some(Settings::default_processes()),
        Some("all") => None,
        Some(n) => Some(
            n.parse::<usize>()
                .map_err(|_| anyhow::anyhow!("invalid --processes value: {n}"))?,
        ),
    };

    let shard = match args.shard.as_deref() {
        None => None,
        Some(spec) => Some(parse_shard(spec)?),
    };

    let (runner_args, datasources) = split_runner_args(rest);

    Ok(Settings {
        command,
        verbose: args.verbose,
        testlevelsplit: args.testlevelsplit,
        processes,
        // Naming an explicit host means an externally managed server.
        pabotlib: !args.no_pabotlib && args.pabotlibhost == "127.0.0.1",
        pabotlibhost: args.pabotlibhost,
        pabotlibport: args.pabotlibport,
        processtimeout: args.processtimeout.map(Duration::from_secs),
        shard,
        artifacts: args.artifacts,
        artifactsinsubfolders: args.artifactsinsubfolders,
        resourcefile: args.resourcefile,
        suitesfrom: args.suitesfrom,
        ordering: args.ordering,
        chunk: args.chunk,
        prerunmodifier: args.pabotprerunmodifier,
        no_rebot: args.no_rebot,
        argumentfiles,
        runner_args,
        datasources,
    })
}

fn parse_shard(spec: &str) -> Result<(usize, usize)> {
    let parts: Vec<&str> = spec.split('/').collect();
    let [index, count] = parts.as_slice() else {
        bail!("--shard expects I/N, got '{spec}'");
    };
    let index: usize = index.parse()?;
    let count: usize = count.parse()?;
    if index == 0 || count == 0 || index > count {
        bail!("--shard index must satisfy 1 <= I <= N, got '{spec}'");
    }
    Ok((index, count))
}

/// Remove a `--command ... --end-command` span; default command is `robot`.
fn extract_command_span(argv: Vec<String>) -> Result<(Vec<String>, Vec<String>)> {
    let Some(start) = argv.iter().position(|a| a == "--command") else {
        return Ok((vec!["robot".to_string()], argv));
    };
    let Some(end) = argv[start..].iter().position(|a| a == "--end-command") else {
        bail!("--command requires a matching --end-command");
    };
    let end = start + end;
    let command: Vec<String> = argv[start + 1..end].to_vec();
    if command.is_empty() {
        bail!("--command span is empty");
    }
    let mut rest = argv;
    rest.drain(start..=end);
    Ok((command, rest))
}

/// Remove numbered `--argumentfileN PATH` pairs.
fn extract_argumentfiles(argv: Vec<String>) -> Result<(Vec<(String, PathBuf)>, Vec<String>)> {
    let pattern = Regex::new(r"^--argumentfile(\d+)$").expect("static regex");
    let mut files = Vec::new();
    let mut rest = Vec::with_capacity(argv.len());
    let mut iter = argv.into_iter();
    while let Some(arg) = iter.next() {
        if let Some(caps) = pattern.captures(&arg) {
            let Some(path) = iter.next() else {
                bail!("{arg} requires a value");
            };
            files.push((caps[1].to_string(), PathBuf::from(path)));
        } else {
            rest.push(arg);
        }
    }
    Ok((files, rest))
}

/// Flags clap owns, with arity. Scanning stops at the first token that is
/// neither of these, which is where the runner's own arguments begin.
const PABOT_FLAGS: &[(&str, bool)] = &[
    ("--verbose", false),
    ("--testlevelsplit", false),
    ("--processes", true),
    ("--pabotlib", false),
    ("--no-pabotlib", false),
    ("--pabotlibhost", true),
    ("--pabotlibport", true),
    ("--processtimeout", true),
    ("--shard", true),
    ("--artifacts", true),
    ("--artifactsinsubfolders", false),
    ("--resourcefile", true),
    ("--suitesfrom", true),
    ("--ordering", true),
    ("--chunk", false),
    ("--pabotprerunmodifier", true),
    ("--no-rebot", false),
    ("--help", false),
    ("--version", false),
];

fn split_pabot_flags(argv: Vec<String>) -> (Vec<String>, Vec<String>) {
    let mut pabot = Vec::new();
    let mut iter = argv.into_iter().peekable();
    while let Some(arg) = iter.peek() {
        match PABOT_FLAGS.iter().find(|(name, _)| name == arg) {
            Some((_, takes_value)) => {
                let flag = iter.next().expect("peeked");
                pabot.push(flag);
                if *takes_value {
                    if let Some(value) = iter.next() {
                        pabot.push(value);
                    }
                }
            }
            None => break,
        }
    }
    (pabot, iter.collect())
}

/// Split pass-through arguments into runner options and datasources.
///
/// The datasources are the trailing run of non-option tokens; when that
/// run directly follows an option flag, its first token is kept as the
/// flag's value.
fn split_runner_args(rest: Vec<String>) -> (Vec<String>, Vec<PathBuf>) {
    let mut boundary = rest.len();
    while boundary > 0 && !rest[boundary - 1].starts_with('-') {
        boundary -= 1;
    }
    if boundary > 0 && rest[boundary - 1].starts_with('-') && boundary < rest.len() {
        boundary += 1;
    }
    let datasources = rest[boundary..].iter().map(PathBuf::from).collect();
    (rest[..boundary].to_vec(), datasources)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Settings {
        parse_cli(args.iter().map(|s| s.to_string())).unwrap()
    }

    #[test]
    fn defaults() {
        let settings = parse(&["tests"]);
        assert_eq!(settings.command, vec!["robot"]);
        assert!(settings.pabotlib);
        assert_eq!(settings.pabotlibport, 8270);
        assert_eq!(settings.artifacts, vec!["png"]);
        assert_eq!(settings.datasources, vec![PathBuf::from("tests")]);
        assert!(settings.processes.unwrap() >= 1);
        assert!(settings.processes.unwrap() <= 2);
    }

    #[test]
    fn processes_all_means_unbounded() {
        let settings = parse(&["--processes", "all", "tests"]);
        assert_eq!(settings.processes, None);
        assert_eq!(settings.worker_budget(17), 17);
    }

    #[test]
    fn command_span_is_extracted() {
        let settings = parse(&[
            "--command",
            "python",
            "-m",
            "robot",
            "--end-command",
            "--processes",
            "3",
            "tests",
        ]);
        assert_eq!(settings.command, vec!["python", "-m", "robot"]);
        assert_eq!(settings.processes, Some(3));
    }

    #[test]
    fn unterminated_command_span_fails() {
        assert!(parse_cli(["--command", "python", "tests"]).is_err());
    }

    #[test]
    fn numbered_argumentfiles() {
        let settings = parse(&[
            "--argumentfile1",
            "a.txt",
            "--argumentfile2",
            "b.txt",
            "tests",
        ]);
        assert_eq!(
            settings.argumentfiles,
            vec![
                ("1".to_string(), PathBuf::from("a.txt")),
                ("2".to_string(), PathBuf::from("b.txt")),
            ]
        );
    }

    #[test]
    fn runner_args_pass_through() {
        let settings = parse(&[
            "--verbose",
            "--include",
            "smoke",
            "--loglevel",
            "DEBUG",
            "suites/a",
            "suites/b",
        ]);
        assert!(settings.verbose);
        assert_eq!(
            settings.runner_args,
            vec!["--include", "smoke", "--loglevel", "DEBUG"]
        );
        assert_eq!(
            settings.datasources,
            vec![PathBuf::from("suites/a"), PathBuf::from("suites/b")]
        );
    }

    #[test]
    fn conflicting_pabotlib_flags_fail() {
        assert!(parse_cli(["--pabotlib", "--no-pabotlib", "tests"]).is_err());
    }

    #[test]
    fn explicit_host_disables_local_server() {
        let settings = parse(&["--pabotlibhost", "10.0.0.5", "tests"]);
        assert!(!settings.pabotlib);
        assert_eq!(settings.pabotlibhost, "10.0.0.5");
    }

    #[test]
    fn shard_parsing() {
        let settings = parse(&["--shard", "2/5", "tests"]);
        assert_eq!(settings.shard, Some((2, 5)));
        assert!(parse_cli(["--shard", "0/5", "tests"]).is_err());
        assert!(parse_cli(["--shard", "6/5", "tests"]).is_err());
        assert!(parse_cli(["--shard", "junk", "tests"]).is_err());
    }

    #[test]
    fn outputdir_comes_from_runner_args() {
        let settings = parse(&["--outputdir", "out", "tests"]);
        assert_eq!(settings.outputdir(), PathBuf::from("out"));
        assert_eq!(settings.results_dir(), PathBuf::from("out/pabot_results"));
    }

    #[test]
    fn processtimeout_becomes_duration() {
        let settings = parse(&["--processtimeout", "5", "tests"]);
        assert_eq!(settings.processtimeout, Some(Duration::from_secs(5)));
    }
}
