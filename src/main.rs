//! # Gateway Core 主程序
//!
//! 运维入口: 数据库迁移、能力表重建、订阅维护以及常驻的后台任务进程

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use gateway_core::{
    AppConfig, GatewayCore, Result,
    channel::AbilityService,
    config::{load_config, load_config_from},
    database::{init_database, run_migrations},
    lerror, linfo,
    logging::{self, LogComponent, LogStage},
    quota::QuotaLedger,
    subscription::SubscriptionLedger,
    task::AsyncTaskReconciler,
};
use sea_orm::DatabaseConnection;

#[derive(Parser)]
#[command(name = "gateway-core", version, about = "LLM 网关核心运维工具")]
struct Cli {
    /// 配置文件路径, 缺省时按 `RUST_ENV` 读取 `config/config.{env}.toml`
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 执行数据库迁移
    Migrate,
    /// 按渠道表全量重建能力表
    RebuildAbilities,
    /// 重置已到期的订阅额度
    ResetSubscriptions {
        #[arg(long)]
        limit: Option<u64>,
    },
    /// 处理已过期的订阅
    ExpireSubscriptions {
        #[arg(long)]
        limit: Option<u64>,
    },
    /// 清理过旧的预扣记录
    CleanupPreConsume {
        /// 保留时长（秒）, 缺省使用配置值
        #[arg(long)]
        older_than: Option<i64>,
    },
    /// 收尾超时的异步任务
    SweepTasks {
        #[arg(long)]
        limit: Option<u64>,
    },
    /// 常驻运行后台任务, 直到收到 Ctrl-C
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    logging::init_optimized_logging(config.log_level.as_ref());

    if let Err(err) = run(cli.command, config).await {
        lerror!(
            "system",
            LogStage::Internal,
            LogComponent::Main,
            "command_failed",
            "命令执行失败",
            error = %err
        );
        return Err(err);
    }
    Ok(())
}

async fn run(command: Command, config: AppConfig) -> Result<()> {
    if matches!(command, Command::Serve) {
        return serve(config).await;
    }

    let db = Arc::new(connect(&config).await?);
    match command {
        Command::Migrate => {}
        Command::RebuildAbilities => {
            let (success, fails) = AbilityService::new(db).rebuild_abilities().await?;
            linfo!(
                "system",
                LogStage::Db,
                LogComponent::Ability,
                "rebuild_done",
                "能力表重建完成",
                success = success,
                fails = fails
            );
        }
        Command::ResetSubscriptions { limit } => {
            let limit = limit.unwrap_or(config.subscription.batch_limit);
            let count = SubscriptionLedger::new(db).reset_due(limit).await?;
            linfo!("system", LogStage::BackgroundTask, LogComponent::Subscription, "reset_done", "订阅重置完成", count = count);
        }
        Command::ExpireSubscriptions { limit } => {
            let limit = limit.unwrap_or(config.subscription.batch_limit);
            let count = SubscriptionLedger::new(db).expire_due(limit).await?;
            linfo!("system", LogStage::BackgroundTask, LogComponent::Subscription, "expire_done", "订阅过期处理完成", count = count);
        }
        Command::CleanupPreConsume { older_than } => {
            let ttl = older_than.unwrap_or_else(|| {
                i64::try_from(config.subscription.pre_consume_record_ttl_secs).unwrap_or(i64::MAX)
            });
            let deleted = SubscriptionLedger::new(db).cleanup_pre_consume_records(ttl).await?;
            linfo!("system", LogStage::BackgroundTask, LogComponent::Subscription, "cleanup_done", "预扣记录清理完成", deleted = deleted);
        }
        Command::SweepTasks { limit } => {
            let quota = Arc::new(QuotaLedger::new(db.clone(), None, None));
            let subscriptions = Arc::new(SubscriptionLedger::new(db.clone()));
            let reconciler = AsyncTaskReconciler::new(db, quota, subscriptions, config.task.timeout_secs);
            let swept = reconciler
                .sweep_timed_out(limit.unwrap_or(config.task.sweep_limit))
                .await?;
            linfo!("system", LogStage::BackgroundTask, LogComponent::TaskReconciler, "sweep_done", "超时任务收尾完成", swept = swept);
        }
        Command::Serve => {}
    }
    Ok(())
}

async fn connect(config: &AppConfig) -> Result<DatabaseConnection> {
    let db = init_database(&config.database).await?;
    run_migrations(&db).await?;
    Ok(db)
}

async fn serve(config: AppConfig) -> Result<()> {
    let core = GatewayCore::bootstrap(config).await?;
    core.start_background_tasks().await?;
    linfo!("system", LogStage::Startup, LogComponent::Main, "service_started", "后台任务已启动, Ctrl-C 退出");

    if let Err(err) = tokio::signal::ctrl_c().await {
        lerror!("system", LogStage::Shutdown, LogComponent::Main, "signal_failed", "监听退出信号失败", error = %err);
    }
    core.shutdown().await
}
