use anyhow::Context;
use clap::{Parser, Subcommand};
use pushsync_lib::config::PushConfig;
use pushsync_lib::core::conflict::{
    ChannelPrompt, Collision, CollisionAction, CollisionDecision, CollisionKind, CollisionPrompt,
    PolicyPrompt, PromptRequest,
};
use pushsync_lib::core::transfer::{QueueObserver, QueueProgress, RunSummary, TransferTask};
use pushsync_lib::core::PushService;
use pushsync_lib::error::TransferError;
use pushsync_lib::logging::{LogConfig, SizeRotatingWriter};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "pushsync", version, about = "Push workspace files to a remote root")]
struct Cli {
    /// 配置文件路径（默认 <配置目录>/pushsync/push.json）
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 上传文件或目录
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// 下载本地路径对应的远程文件或目录
    Download {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// 列出远程目录
    List { dir: String },
}

/// 初始化日志系统
fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    if !config.enabled {
        // 日志已禁用，只初始化一个空的 subscriber
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return None;
    }

    let mut env_filter =
        tracing_subscriber::EnvFilter::from_default_env().add_directive(config.tracing_level().into());
    for directive in ["opendal=warn", "openssh=warn", "hyper=warn"] {
        if let Ok(d) = directive.parse() {
            env_filter = env_filter.add_directive(d);
        }
    }

    let log_dir = config.log_dir();
    match SizeRotatingWriter::new(&log_dir, config.max_size_mb) {
        Ok(file_writer) => {
            let (writer, guard) = tracing_appender::non_blocking(file_writer);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);

            // 在 debug 模式下也输出到控制台
            #[cfg(debug_assertions)]
            {
                let console_layer = tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer)
                    .with(console_layer)
                    .try_init();
            }

            #[cfg(not(debug_assertions))]
            {
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer)
                    .try_init();
            }

            Some(guard)
        }
        Err(e) => {
            // 文件日志创建失败，回退到控制台
            eprintln!("无法创建日志文件 {:?}: {}", log_dir, e);
            let _ = tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(env_filter)
                .try_init();
            None
        }
    }
}

/// 终端进度输出
struct CliObserver;

impl QueueObserver for CliObserver {
    fn on_progress(&self, progress: &QueueProgress) {
        println!("[{}/{}] {}", progress.index, progress.total, progress.label);
    }

    fn on_task_failed(&self, task: &TransferTask, error: &TransferError) {
        tracing::error!("任务失败 {}: {}", task.dest, error);
        eprintln!("失败: {} ({})", task.dest, error);
    }

    fn on_force_stop(&self, remaining: usize) {
        tracing::warn!("队列被强制停止，{} 个任务已取消", remaining);
        eprintln!("已强制停止，{} 个任务被取消", remaining);
    }
}

/// 选项文本与对应的决定
fn prompt_choices(collision: &Collision) -> Vec<(&'static str, CollisionDecision)> {
    let mut choices = vec![
        ("跳过", CollisionDecision::once(CollisionAction::Skip)),
        ("重命名", CollisionDecision::once(CollisionAction::Rename)),
        ("停止", CollisionDecision::once(CollisionAction::Stop)),
    ];
    if collision.kind != CollisionKind::TypeMismatch {
        choices.extend([
            ("覆盖", CollisionDecision::once(CollisionAction::Overwrite)),
            ("全部跳过", CollisionDecision::for_all(CollisionAction::Skip)),
            ("全部重命名", CollisionDecision::for_all(CollisionAction::Rename)),
            ("全部覆盖", CollisionDecision::for_all(CollisionAction::Overwrite)),
        ]);
    }
    choices
}

/// 在终端上回答冲突提示，默认跳过
fn ask_on_terminal(collision: &Collision) -> CollisionDecision {
    let choices = prompt_choices(collision);
    println!("{}", collision.message());
    for (i, (label, _)) in choices.iter().enumerate() {
        println!("  {}) {}", i + 1, label);
    }
    print!("请选择 [1]: ");
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    if std::io::stdin().lock().read_line(&mut line).unwrap_or(0) == 0 {
        // 输入已关闭
        return CollisionDecision::once(CollisionAction::Stop);
    }

    line.trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| choices.get(i))
        .map(|(_, decision)| *decision)
        .unwrap_or(CollisionDecision::once(CollisionAction::Skip))
}

async fn answer_prompts(mut requests: mpsc::Receiver<PromptRequest>) {
    while let Some(request) = requests.recv().await {
        let collision = request.collision.clone();
        let decision = tokio::task::spawn_blocking(move || ask_on_terminal(&collision))
            .await
            .unwrap_or(CollisionDecision::once(CollisionAction::Stop));
        let _ = request.respond_to.send(decision);
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "完成 [{:?}]: 成功 {}, 失败 {}, 跳过 {}, 取消 {}",
        summary.state, summary.succeeded, summary.failed, summary.skipped, summary.cancelled
    );
    for failure in &summary.failures {
        println!("  失败: {} ({})", failure.dest, failure.error);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(PushConfig::default_path);
    let config = PushConfig::load(&config_path)?;
    let log_guard = init_logging(&config.log);
    tracing::info!("使用配置文件: {:?}", config_path);

    let prompt: Arc<dyn CollisionPrompt> = match config.collision.policy {
        Some(action) => Arc::new(PolicyPrompt::new(action)),
        None => {
            let (prompt, requests) = ChannelPrompt::new(1);
            tokio::spawn(answer_prompts(requests));
            Arc::new(prompt)
        }
    };

    let service = Arc::new(
        PushService::connect(config, prompt)
            .await
            .context("初始化推送服务失败")?
            .with_observer(Arc::new(CliObserver)),
    );

    // Ctrl-C 请求取消，宽限期后强制停止
    {
        let service = service.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("正在取消...");
                service.queue().cancel();
            }
        });
    }

    let result: Result<Vec<RunSummary>, TransferError> = match cli.command {
        Command::Upload { paths } => service
            .upload(paths.as_slice())
            .await
            .map(|s| s.into_iter().collect()),
        Command::Download { paths } => service
            .download(paths.as_slice())
            .await
            .map(|s| s.into_iter().collect()),
        Command::List { dir } => {
            for entry in service.list_remote(&dir).await? {
                let time = chrono::DateTime::from_timestamp(entry.modified_time, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!("{:<4} {}  {}", entry.kind.to_string(), time, entry.name());
            }
            Ok(Vec::new())
        }
    };

    service.teardown().await?;

    let summaries = result?;
    for summary in &summaries {
        print_summary(summary);
    }
    if summaries.iter().any(|s| s.failed > 0) {
        drop(log_guard);
        std::process::exit(1);
    }
    Ok(())
}
