use clap::Parser;
use firesync_lib::logging::{LogConfig, SizeRotatingWriter};
use firesync_lib::{
    run, Collaborators, DefaultConnector, LocalFileSystem, RunOutcome, SyncError, SyncMode,
    SyncOptions, TracingSink,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

/// 推送、拉取或实时同步本地数据文件与远程键值树
#[derive(Debug, Parser)]
#[command(name = "firesync", version)]
struct Cli {
    /// JSON 配置文件
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// push | pull | live（也接受 upload / download / watch）
    #[arg(short, long)]
    mode: Option<SyncMode>,

    /// 远程根地址
    #[arg(short, long)]
    reference: Option<String>,

    /// 认证令牌
    #[arg(short, long, env = "FIRESYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// 拉取目标目录
    #[arg(short, long)]
    dest: Option<PathBuf>,

    /// 拉取的远程键
    #[arg(short, long)]
    source: Option<String>,

    /// 文件匹配模式
    patterns: Vec<String>,
}

impl Cli {
    /// 命令行参数覆盖配置文件
    fn into_options(self) -> anyhow::Result<SyncOptions> {
        let mut options = match &self.config {
            Some(path) => SyncOptions::load(path)?,
            None => SyncOptions::default(),
        };

        if let Some(mode) = self.mode {
            options.mode = mode;
        }
        if self.reference.is_some() {
            options.reference = self.reference;
        }
        if self.token.is_some() {
            options.token = self.token;
        }
        if self.dest.is_some() {
            options.dest = self.dest;
        }
        if self.source.is_some() {
            options.source = self.source;
        }
        if !self.patterns.is_empty() {
            options.file_patterns = self.patterns;
        }
        Ok(options)
    }
}

/// 初始化日志系统
fn init_logging(config: &LogConfig) {
    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return;
    }

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(config.tracing_level().into())
        .add_directive("hyper=warn".parse().unwrap_or_else(|_| tracing::Level::WARN.into()))
        .add_directive("reqwest=warn".parse().unwrap_or_else(|_| tracing::Level::WARN.into()));

    match SizeRotatingWriter::new(&config.log_dir(), config.max_size_mb) {
        Ok(file_writer) => {
            // 文件日志层 - 始终输出到文件
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(false);

            // 在 debug 模式下也输出到控制台
            #[cfg(debug_assertions)]
            {
                let console_layer = tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false);
                let subscriber = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer)
                    .with(console_layer);
                let _ = tracing::subscriber::set_global_default(subscriber);
            }

            #[cfg(not(debug_assertions))]
            {
                let subscriber = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer);
                let _ = tracing::subscriber::set_global_default(subscriber);
            }
        }
        Err(e) => {
            // 文件日志创建失败，回退到控制台
            eprintln!("无法创建日志文件: {}", e);
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}

fn print_failure(error: &SyncError) {
    match error {
        SyncError::Configuration(fields) => {
            for field in fields {
                eprintln!("{}", field);
            }
        }
        other => eprintln!("{}", other),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let options = match Cli::parse().into_options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&options.log);

    let fs = match LocalFileSystem::current_dir() {
        Ok(fs) => fs,
        Err(e) => {
            eprintln!("无法访问当前目录: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    let collaborators = Collaborators {
        fs: Arc::new(fs),
        connector: Arc::new(DefaultConnector),
        log: Arc::new(TracingSink),
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("收到中断信号，正在停止");
            ctrl_c.cancel();
        }
    });

    match run(&options, &collaborators, cancel).await {
        Ok(RunOutcome::Push(report)) => {
            for error in &report.errors {
                eprintln!("{}", error);
            }
            println!(
                "推送完成: 匹配 {}，成功 {}，失败 {}",
                report.files_matched, report.files_written, report.files_failed
            );
            if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Ok(RunOutcome::Pull(report)) => {
            println!("已下载 {} -> {}", report.remote_path, report.target.display());
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::Live(report)) => {
            println!(
                "实时同步结束: 上传 {}，下载 {}，失败 {}",
                report.uploads, report.downloads, report.failures
            );
            if report.remote_lost {
                eprintln!("远程订阅中途断开，之后的远程变化没有同步到本地");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            print_failure(&e);
            ExitCode::FAILURE
        }
    }
}
