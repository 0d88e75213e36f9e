use anyhow::Context;
use clap::{CommandFactory, Parser};
use colored::*;
use log::{debug, warn};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use std::sync::Arc;

use zapflow_core::{
    persist, read_lines, render, CancelFlag, ConsoleSink, PhaseOrchestrator, ProbeKind, ReportFormat, ScanConfig,
    Severity, ZapEngine,
};

#[derive(Parser, Debug)]
#[command(
    name = "zapflow",
    version,
    about = "Phased DAST runs through a ZAP scanning proxy",
    override_usage = "zapflow <target>  <options>",
    after_help = "\x1b[1;36mEXAMPLES:\x1b[0m
  Engine scans only, no probes:   zapflow http://localhost:5000
  From a config file:             zapflow -c demos/server-scan.json
  Show the probe matrix:          zapflow -c demos/server-scan.json --dry-run
  Selected probes only:           zapflow http://localhost:5000 --probes xss,idor,csrf
  Remote engine with key:         zapflow http://localhost:5000 --proxy http://10.0.0.5:8090 --api-key KEY
  JSON report + engine report:    zapflow http://localhost:5000 --format json -o run.json --engine-report zap.html
  Scan from file:                 zapflow -c scan.json -l targets.txt"
)]
pub struct Args {
    pub target: Option<String>,

    #[arg(short = 'c', long, help = "JSON run configuration")]
    pub config: Option<PathBuf>,

    #[arg(short = 'l', long = "list", help = "File containing target URLs (one per line)")]
    pub list: Option<String>,

    #[arg(long, help = "Engine proxy / API address (e.g. http://127.0.0.1:8080)")]
    pub proxy: Option<String>,

    #[arg(long, help = "Engine API key")]
    pub api_key: Option<String>,

    #[arg(short = 'o', long, help = "Report output path")]
    pub output: Option<String>,

    #[arg(long,
        value_parser = clap::builder::PossibleValuesParser::new(["html", "json"]),
        help = "Report format")]
    pub format: Option<String>,

    #[arg(long, help = "Also save the engine's own HTML report to this path")]
    pub engine_report: Option<String>,

    #[arg(long, help = "Seconds between status polls")]
    pub poll_interval: Option<u64>,

    #[arg(long, help = "Maximum seconds to wait for a single phase")]
    pub phase_timeout: Option<u64>,

    #[arg(short = 't', long, help = "Number of probes in flight at once")]
    pub threads: Option<usize>,

    #[arg(long, value_delimiter = ',', value_parser = parse_probe,
        help = "Comma-separated probes to run (auth-bypass,csrf,xss,nosql-injection,sensitive-data,idor,fuzz)")]
    pub probes: Vec<ProbeKind>,

    #[arg(short = 'H', long = "header", help = "Session header (e.g. \"Authorization: Bearer TOKEN\")")]
    pub headers: Vec<String>,

    #[arg(long, default_value_t = false, help = "Skip the engine's active scan")]
    pub skip_active: bool,

    #[arg(long, help = "Print the planned probe matrix without contacting the engine")]
    pub dry_run: bool,

    #[arg(short = 'v', long, default_value_t = false, help = "Debug logging")]
    pub verbose: bool,
}

fn parse_probe(raw: &str) -> Result<ProbeKind, String> {
    ProbeKind::from_str(raw).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let code = match run(args).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            eprint!("{}\r\n", format!("[!] {:#}", e).red());
            1
        }
    };
    process::exit(code);
}

/// Runs every target in turn. `Ok(false)` means at least one run failed.
async fn run(args: Args) -> anyhow::Result<bool> {
    let base = match args.config {
        Some(ref path) => ScanConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => ScanConfig::default(),
    };

    let targets = collect_targets(&args, &base)?;
    if targets.is_empty() {
        eprint!("{}\r\n", "[!] No targets specified. Provide a URL, -l <file> or a config with a target.".red());
        let mut cmd = Args::command();
        cmd.print_help().ok();
        return Ok(false);
    }

    let cancel = CancelFlag::new();
    if !args.dry_run {
        let flag = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping at the next checkpoint");
                flag.cancel();
            }
        });
    }

    let total = targets.len();
    let mut all_ok = true;
    for (i, target) in targets.iter().enumerate() {
        if cancel.is_cancelled() {
            all_ok = false;
            break;
        }
        if total > 1 {
            print!(
                "\r\n{}\r\n",
                format!("━━━ Target {}/{}: {} ━━━", i + 1, total, target).bright_white().bold()
            );
            std::io::stdout().flush().ok();
        }

        let mut config = apply_overrides(base.clone(), &args, target)?;
        if total > 1 {
            config.output = numbered(&config.output, i + 1);
            config.engine_report = config.engine_report.map(|p| numbered(&p, i + 1));
        }

        if args.dry_run {
            print_plan(config)?;
            continue;
        }

        if let Err(e) = run_target(config, cancel.clone()).await {
            eprint!("{}\r\n", format!("[!] {}: {:#}", target, e).red());
            all_ok = false;
        }
    }
    Ok(all_ok)
}

fn collect_targets(args: &Args, base: &ScanConfig) -> anyhow::Result<Vec<String>> {
    let mut targets = Vec::new();
    if let Some(ref list_path) = args.list {
        let lines = read_lines(list_path).with_context(|| format!("failed to read '{}'", list_path))?;
        print!(
            "{}\r\n",
            format!("[+] Loaded {} target(s) from {}", lines.len(), list_path).green().bold()
        );
        std::io::stdout().flush().ok();
        targets.extend(lines);
    }
    if let Some(ref t) = args.target {
        targets.push(t.clone());
    }
    if targets.is_empty() && !base.target.trim().is_empty() {
        targets.push(base.target.clone());
    }
    Ok(targets)
}

fn apply_overrides(mut config: ScanConfig, args: &Args, target: &str) -> anyhow::Result<ScanConfig> {
    config.target = target.to_string();
    if let Some(ref proxy) = args.proxy {
        config.engine_addr = proxy.clone();
    }
    if let Some(ref key) = args.api_key {
        config.api_key = key.clone();
    }
    if let Some(ref output) = args.output {
        config.output = output.clone();
    }
    if let Some(ref format) = args.format {
        config.format = ReportFormat::from_str(format)?;
    }
    if let Some(ref path) = args.engine_report {
        config.engine_report = Some(path.clone());
    }
    if let Some(secs) = args.poll_interval {
        config.poll_interval = secs;
    }
    if let Some(secs) = args.phase_timeout {
        config.phase_timeout = secs;
    }
    if let Some(n) = args.threads {
        config.threads = n;
    }
    if !args.probes.is_empty() {
        config.enabled_probes = args.probes.clone();
    }
    config.session.headers.extend(args.headers.iter().cloned());
    config.skip_active |= args.skip_active;

    config.validate().context("invalid run configuration")?;
    Ok(config)
}

/// `report.html` -> `report-2.html`.
fn numbered(path: &str, n: usize) -> String {
    let p = Path::new(path);
    let stem = p.file_stem().and_then(|s| s.to_str()).unwrap_or("report");
    let name = match p.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}-{}.{}", stem, n, ext),
        None => format!("{}-{}", stem, n),
    };
    p.with_file_name(name).to_string_lossy().into_owned()
}

fn print_plan(config: ScanConfig) -> anyhow::Result<()> {
    let target = config.target.clone();
    let warning = catalog_warning(&config);
    let engine = Arc::new(ZapEngine::from_config(&config)?);
    let orchestrator = PhaseOrchestrator::new(engine, config)?;
    let plan = orchestrator.plan();

    print!("{}\r\n", format!("[DRY RUN] {}: {} probe run(s)", target, plan.len()).bright_cyan().bold());
    if let Some(warning) = warning {
        print!("{}\r\n", warning.yellow());
    }
    for (endpoint, kind) in plan {
        print!("  {:<16} {}\r\n", kind.to_string(), endpoint);
    }
    std::io::stdout().flush().ok();
    Ok(())
}

async fn run_target(config: ScanConfig, cancel: CancelFlag) -> anyhow::Result<()> {
    print_scan_config(&config);

    let output = PathBuf::from(&config.output);
    let engine_report = config.engine_report.clone();
    let format = config.format;

    let engine = Arc::new(ZapEngine::from_config(&config)?);
    let mut orchestrator = PhaseOrchestrator::new(engine, config)?
        .with_sink(ConsoleSink::new_ref())
        .with_cancel_flag(cancel);

    let outcome = orchestrator.run().await?;
    debug!("Run transitions: {:?}", outcome.transitions);

    print_summary(&outcome.report);

    persist(&render(&outcome.report, format), &output)?;
    print!("{}\r\n", format!("[+] Report saved to {}", output.display()).green().bold());

    if let (Some(path), Some(bytes)) = (engine_report, outcome.engine_report) {
        let path = PathBuf::from(path);
        persist(&bytes, &path)?;
        print!("{}\r\n", format!("[+] Engine report saved to {}", path.display()).green());
    }
    std::io::stdout().flush().ok();
    Ok(())
}

/// Without an endpoint catalog the run is spider and active scan only.
fn catalog_warning(config: &ScanConfig) -> Option<String> {
    if config.endpoints.is_empty() {
        Some("[!] No endpoints configured: no probes will run (declare endpoints with -c)".to_string())
    } else {
        None
    }
}

fn print_scan_config(config: &ScanConfig) {
    let probes: Vec<String> = config.enabled_probes.iter().map(|p| p.to_string()).collect();

    print!("{}\r\n", format!("[+] Target:     {}", config.target).green().bold());
    print!("{}\r\n", format!("[+] Engine:     {}", config.engine_addr).blue());
    print!("{}\r\n", format!("[+] Endpoints:  {}", config.endpoints.len()).blue());
    if let Some(warning) = catalog_warning(config) {
        print!("{}\r\n", warning.yellow());
    }
    print!("{}\r\n", format!("[+] Probes:     {}", probes.join(",")).magenta());
    print!("{}\r\n", format!("[+] Threads:    {}", config.threads).blue());
    print!(
        "{}\r\n",
        format!("[+] Polling:    every {}s, {}s per phase", config.poll_interval, config.phase_timeout).blue()
    );
    print!("{}\r\n", format!("[+] Output:     {}", config.output).blue());
    if config.skip_active {
        print!("{}\r\n", "[+] Active:     skipped".yellow());
    }
    if !config.session.headers.is_empty() {
        print!("{}\r\n", format!("[+] Headers:    {} session", config.session.headers.len()).yellow());
    }
    print!("{}\r\n", "──────────────────────────────────────────────────".dimmed());
    std::io::stdout().flush().ok();
}

fn print_summary(report: &zapflow_core::Report) {
    print!("\r\n{}\r\n", "── Summary ──".bright_white().bold());
    print!("{}\r\n", format!("High:   {}", report.count(Severity::High)).red().bold());
    print!("{}\r\n", format!("Medium: {}", report.count(Severity::Medium)).yellow());
    print!("{}\r\n", format!("Low:    {}", report.count(Severity::Low)).blue());
    print!("{}\r\n", format!("Info:   {}", report.count(Severity::Info)).dimmed());
    print!("{}\r\n", format!("Hosts:  {}", report.hosts_scanned.len()).white());
    std::io::stdout().flush().ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbered_output() {
        assert_eq!(numbered("report.html", 2), "report-2.html");
        assert_eq!(numbered("out/run.json", 1), "out/run-1.json");
        assert_eq!(numbered("report", 3), "report-3");
    }

    #[test]
    fn test_overrides_take_precedence() {
        let args = Args::parse_from([
            "zapflow",
            "--proxy",
            "http://10.0.0.5:8090",
            "--probes",
            "xss,idor",
            "--threads",
            "8",
            "--format",
            "json",
            "--skip-active",
        ]);
        let config = apply_overrides(ScanConfig::default(), &args, "http://localhost:5000").unwrap();
        assert_eq!(config.engine_addr, "http://10.0.0.5:8090");
        assert_eq!(config.enabled_probes, vec![ProbeKind::Xss, ProbeKind::Idor]);
        assert_eq!(config.threads, 8);
        assert_eq!(config.format, ReportFormat::Json);
        assert!(config.skip_active);
    }

    #[test]
    fn test_empty_catalog_is_flagged() {
        let mut config = ScanConfig::default();
        assert!(catalog_warning(&config).is_some());
        config.endpoints = vec![zapflow_core::Endpoint::new("/", zapflow_core::Sensitivity::Public)];
        assert!(catalog_warning(&config).is_none());
    }

    #[test]
    fn test_overrides_are_validated() {
        let args = Args::parse_from(["zapflow", "--poll-interval", "30", "--phase-timeout", "10"]);
        assert!(apply_overrides(ScanConfig::default(), &args, "http://localhost:5000").is_err());
    }
}
