use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::sync::mpsc;
use treesync_lib::config::{app_config_dir, RemoteDefaults, SyncDefaults};
use treesync_lib::core::{run_sync, SyncEvent, SyncReport};
use treesync_lib::logging::{get_log_dir, init_logging};
use treesync_lib::{HostKeyPolicy, SyncError, SyncOptions};

/// 单向同步文件树到本地目录或 SFTP 主机
#[derive(Parser)]
#[command(name = "treesync", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 同步文件或目录
    Sync(SyncArgs),
    /// 显示工具信息
    Info,
}

#[derive(Args)]
struct SyncArgs {
    /// 源路径（本地文件或目录）
    #[arg(short, long)]
    source: PathBuf,

    /// 目标路径（本地路径，或指定 --host 时为远程路径）
    #[arg(short, long)]
    destination: String,

    /// 递归同步子目录
    #[arg(short, long)]
    recursive: bool,

    /// 输出每个目录和文件的处理情况
    #[arg(short, long)]
    verbose: bool,

    /// 包含以 . 开头的文件和目录
    #[arg(short = 'H', long)]
    hidden: bool,

    /// 远程主机
    #[arg(long)]
    host: Option<String>,

    /// 远程用户名
    #[arg(long)]
    user: Option<String>,

    /// SSH 私钥路径
    #[arg(long)]
    key: Option<PathBuf>,

    /// SSH 端口（默认读取配置，未配置时为 22）
    #[arg(long)]
    port: Option<u16>,

    /// 主机密钥校验策略
    #[arg(long, value_enum)]
    host_key_policy: Option<HostKeyPolicy>,

    /// known_hosts 文件路径（默认 ~/.ssh/known_hosts）
    #[arg(long)]
    known_hosts: Option<PathBuf>,

    /// 同一目录内并发传输的文件数
    #[arg(short, long)]
    jobs: Option<usize>,

    /// 以 JSON 输出同步报告
    #[arg(long)]
    json: bool,
}

impl SyncArgs {
    fn into_options(self, config_dir: &Path) -> Result<(SyncOptions, bool), SyncError> {
        let given = [self.host.is_some(), self.user.is_some(), self.key.is_some()];
        if given.iter().any(|g| *g) && !given.iter().all(|g| *g) {
            return Err(SyncError::Config(
                "远程同步需要同时指定 --host、--user 和 --key".to_string(),
            ));
        }

        let mut remote_defaults = RemoteDefaults::load(config_dir);
        if let Some(port) = self.port {
            remote_defaults.port = port;
        }
        if let Some(policy) = self.host_key_policy {
            remote_defaults.host_key_policy = policy;
        }
        if self.known_hosts.is_some() {
            remote_defaults.known_hosts = self.known_hosts;
        }

        let jobs = self
            .jobs
            .unwrap_or_else(|| SyncDefaults::load(config_dir).jobs);

        let options = SyncOptions::new(self.source, self.destination)
            .recursive(self.recursive)
            .verbose(self.verbose)
            .hidden(self.hidden)
            .jobs(jobs)
            .with_remote(self.host, self.user, self.key, &remote_defaults);

        Ok((options, self.json))
    }
}

fn print_info(config_dir: &Path) {
    println!("treesync {}", env!("CARGO_PKG_VERSION"));
    println!("单向同步文件和目录到本地路径或 SFTP 主机。");
    println!("按大小和修改时间判断文件是否变化，复制后保留权限和修改时间，");
    println!("远程同步时同时保留所有者。");
    println!();
    println!("配置文件: {}", config_dir.join("config.json").display());
    println!("日志目录: {}", get_log_dir(config_dir).display());
}

fn print_summary(report: &SyncReport, verbose: bool) {
    if verbose {
        println!(
            "复制 {} 个文件, 跳过 {} 个, {} 字节, 用时 {}s",
            report.files_copied, report.files_skipped, report.bytes_transferred, report.duration
        );
    }

    if report.is_success() {
        println!("同步完成");
    } else {
        for line in failure_lines(report, verbose) {
            eprintln!("{}", line);
        }
    }
}

/// verbose 模式下失败已由事件逐条输出，这里只给出数量
fn failure_lines(report: &SyncReport, verbose: bool) -> Vec<String> {
    if verbose {
        return vec![format!("同步完成，但有 {} 个错误", report.errors.len())];
    }
    let mut lines = vec![format!("同步完成，但有 {} 个错误:", report.errors.len())];
    lines.extend(report.errors.iter().map(|err| format!("  {}", err)));
    lines
}

async fn run(args: SyncArgs, config_dir: &Path) -> ExitCode {
    let (options, json) = match args.into_options(config_dir) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };
    let verbose = options.verbose;

    if verbose {
        println!(
            "开始同步 {} -> {}",
            options.source.display(),
            options.destination
        );
        println!(
            "recursive={}, hidden={}, remote={}",
            options.recursive,
            options.hidden,
            options.is_remote()
        );
    }

    let (tx, printer) = if verbose {
        let (tx, mut rx) = mpsc::channel::<SyncEvent>(256);
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    SyncEvent::Warning { .. } | SyncEvent::Failed { .. } => eprintln!("{}", event),
                    _ => println!("{}", event),
                }
            }
        });
        (Some(tx), Some(printer))
    } else {
        (None, None)
    };

    let result = run_sync(options, tx).await;
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    match result {
        Ok(report) => {
            if json {
                match serde_json::to_string_pretty(&report) {
                    Ok(out) => println!("{}", out),
                    Err(e) => eprintln!("序列化报告失败: {}", e),
                }
            } else {
                print_summary(&report, verbose);
            }
            if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(e) => {
            tracing::error!("同步失败: {}", e);
            eprintln!("同步失败: {}", e);
            ExitCode::from(2)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_dir = app_config_dir();

    match cli.command {
        Commands::Info => {
            print_info(&config_dir);
            ExitCode::SUCCESS
        }
        Commands::Sync(args) => {
            init_logging(&config_dir);
            run(args, &config_dir).await
        }
    }
}
