//! # Upstream Scheduler 命令行
//!
//! 加载配置与渠道目录，执行一次渠道探测或输出运行时状态。

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use upstream_scheduler::error::prelude::{Context, ProbeError, ProxyError, Result};
use upstream_scheduler::{
    ChannelProber, HttpTransport, InMemoryConfigSource, SchedulerService,
    config::{self, AppConfig},
    linfo, lwarn,
    logging::{self, LogComponent, LogStage},
    types::{ChannelId, ChannelModelId},
};

#[derive(Debug, Parser)]
#[command(name = "upstream-scheduler", version, about = "LLM 网关上游调度与健康探测")]
struct Cli {
    /// 配置文件路径，缺省时按 RUST_ENV 读取 config/config.{env}.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 对渠道发起流式探测并输出汇总
    Probe {
        #[arg(long)]
        channel: ChannelId,
        /// 模型绑定 ID，可重复
        #[arg(long = "model")]
        models: Vec<ChannelModelId>,
    },
    /// 探测封禁已到期的渠道，通过则解除封禁，否则重新封禁
    ProbeDue {
        /// 本轮最多探测的渠道数，0 取默认值
        #[arg(long, default_value_t = 1)]
        max: usize,
    },
    /// 以 JSON 输出置顶信息与运行时状态
    Inspect {
        #[arg(long)]
        channel: Option<ChannelId>,
    },
    /// 校验配置文件
    CheckConfig,
}

fn load(path: Option<&PathBuf>) -> Result<AppConfig> {
    match path {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load(cli.config.as_ref())?;
    logging::init_logging(Some(&config.logging.level), config.logging.json);

    let snapshot = config.catalog.to_snapshot().context("渠道目录无效")?;
    let source = Arc::new(InMemoryConfigSource::new(snapshot));
    let service = Arc::new(SchedulerService::new(config.scheduler.clone()));

    match cli.command {
        Command::CheckConfig => {
            linfo!(
                "system",
                LogStage::Configuration,
                LogComponent::Main,
                "config_valid",
                "配置校验通过",
                channels = config.catalog.channels.len()
            );
            println!("configuration ok: {} channels", config.catalog.channels.len());
        }
        Command::Probe { channel, models } => {
            let transport = Arc::new(HttpTransport::new(source.clone(), config.upstream.clone())?);
            let prober = ChannelProber::new(source, transport, service, config.probe.clone());
            let models = (!models.is_empty()).then_some(models);
            match prober.run_channel_probe(channel, models).await {
                Ok(summary) => println!("{summary}"),
                Err(ProbeError::Failed { summary, .. }) => {
                    lwarn!(
                        "system",
                        LogStage::Probe,
                        LogComponent::Main,
                        "probe_unhealthy",
                        "渠道探测未通过",
                        channel_id = channel
                    );
                    println!("{summary}");
                    std::process::exit(2);
                }
                Err(err) => return Err(ProxyError::from(err)),
            }
        }
        Command::ProbeDue { max } => {
            let transport = Arc::new(HttpTransport::new(source.clone(), config.upstream.clone())?);
            let prober = ChannelProber::new(source, transport, service, config.probe.clone());
            let outcomes = prober.run_due_probes(max).await;
            let mut unhealthy = 0;
            for (channel_id, outcome) in &outcomes {
                match outcome {
                    Ok(summary) => println!("channel {channel_id}: {summary}"),
                    Err(err) => {
                        unhealthy += 1;
                        println!("channel {channel_id}: {err}");
                    }
                }
            }
            linfo!(
                "system",
                LogStage::Probe,
                LogComponent::Main,
                "due_probes_finished",
                "到期渠道探测完成",
                probed = outcomes.len(),
                unhealthy = unhealthy
            );
            if unhealthy > 0 {
                std::process::exit(2);
            }
        }
        Command::Inspect { channel } => {
            let now = Utc::now();
            let channels = service.sync_catalog(source.as_ref(), now).await?;

            let ids: Vec<ChannelId> = match channel {
                Some(id) => vec![id],
                None => channels.iter().map(|c| c.id).collect(),
            };
            let stats: Vec<_> = ids
                .into_iter()
                .map(|id| service.runtime_channel_stats(id, now))
                .collect();
            let report = json!({
                "pinned_channel": service.pinned_channel(now),
                "pinned_info": service.pinned_channel_info(),
                "last_success": service.last_success().map(|(selection, at)| json!({
                    "selection": selection,
                    "at": at,
                })),
                "channels": stats,
                "tracked": {
                    "channels": service.tracked().0,
                    "credentials": service.tracked().1,
                },
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
