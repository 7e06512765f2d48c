use std::sync::mpsc;

use netduplex::core::adapter::Adapter;
use netduplex::core::config::EngineConfig;
use netduplex::core::connection::ThreadRegistration;
use netduplex::core::engine::NetworkEngine;
use netduplex::core::events::{EngineEvent, EventSink};
use netduplex::utils::logger::LogManager;

const USAGE: &str = "用法:
  NetDuplex [--list] [--json] [--wired-only]   列出物理网卡
  NetDuplex --options <别名>                   列出可选的速度/双工值
  NetDuplex --apply <别名> <值>                设置速度/双工并确认
  NetDuplex --restart <别名>                   禁用后重新启用网卡
  NetDuplex --diagnose                         系统兼容性检查
  NetDuplex --save-config [--wired-only]       将当前配置写入 config.json";

enum Action {
    List { json: bool },
    Options(String),
    Apply(String, String),
    Restart(String),
    Diagnose,
    SaveConfig,
    Help,
}

fn parse_args(args: &[String]) -> Result<Action, String> {
    let position = |flag: &str| args.iter().position(|a| a == flag);
    let value_at = |index: usize, what: &str| {
        args.get(index)
            .filter(|v| !v.starts_with("--"))
            .cloned()
            .ok_or_else(|| format!("缺少{}", what))
    };

    if args.iter().any(|a| a == "--help" || a == "-h" || a == "/?") {
        return Ok(Action::Help);
    }
    if let Some(i) = position("--options") {
        return Ok(Action::Options(value_at(i + 1, "网卡别名")?));
    }
    if let Some(i) = position("--apply") {
        return Ok(Action::Apply(
            value_at(i + 1, "网卡别名")?,
            value_at(i + 2, "速度/双工值")?,
        ));
    }
    if let Some(i) = position("--restart") {
        return Ok(Action::Restart(value_at(i + 1, "网卡别名")?));
    }
    if position("--diagnose").is_some() {
        return Ok(Action::Diagnose);
    }
    if position("--save-config").is_some() {
        return Ok(Action::SaveConfig);
    }
    Ok(Action::List {
        json: position("--json").is_some(),
    })
}

fn print_adapters(adapters: &[Adapter]) {
    if adapters.is_empty() {
        println!("未找到物理网卡");
        return;
    }
    for adapter in adapters {
        println!("{}", adapter.alias);
        println!("  描述: {}", adapter.name);
        println!("  MAC: {}", adapter.mac_address);
        println!("  IP: {}", adapter.ip_address);
        println!(
            "  状态: {}",
            if adapter.is_connected() { "已连接" } else { "未连接" }
        );
        println!("  速度: {}", adapter.speed);
        println!("  双工: {}", adapter.duplex);
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let action = match parse_args(&args) {
        Ok(action) => action,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };
    if let Action::Help = action {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut config = EngineConfig::load();
    if args.iter().any(|a| a == "--wired-only") {
        config.exclude_wireless = true;
    }

    if let Err(e) = LogManager::init(config.log_enabled) {
        eprintln!("初始化日志失败: {}", e);
    }
    log::info!("NetDuplex 启动中...");

    if LogManager::is_enabled() {
        match LogManager::cleanup_old_logs(config.log_retention_days) {
            Ok(n) if n > 0 => log::info!("已清理 {} 个过期日志文件", n),
            Ok(_) => {}
            Err(e) => log::warn!("清理过期日志失败: {}", e),
        }
    }

    let (tx, rx) = mpsc::channel();
    let printer = std::thread::spawn(move || {
        for event in rx {
            match event {
                EngineEvent::Progress(message) => println!("{}", message),
                EngineEvent::ConvergenceStarted { alias, target } => {
                    println!("正在确认 {} 是否已切换到 {}...", alias, target)
                }
                _ => {}
            }
        }
    });

    let engine = NetworkEngine::new(config, EventSink::new(tx));
    let _registration = ThreadRegistration::new(engine.connection().factory());

    let result = run(&engine, action);

    engine.shutdown();
    drop(_registration);
    drop(engine);
    let _ = printer.join();

    result
}

fn run(engine: &NetworkEngine, action: Action) -> anyhow::Result<()> {
    match action {
        Action::List { json } => {
            let adapters = engine.list_adapters()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&adapters)?);
            } else {
                print_adapters(&adapters);
            }
        }
        Action::Options(alias) => {
            for option in engine.get_options(&alias, false) {
                println!("{}", option);
            }
        }
        Action::Apply(alias, value) => {
            match engine.apply_and_confirm(&alias, &value) {
                Ok(report) => println!("{}", report),
                Err(e) => {
                    if e.needs_elevation() {
                        eprintln!("请右键选择“以管理员身份运行”后重试");
                    }
                    return Err(e.into());
                }
            }
        }
        Action::Restart(alias) => match engine.restart_adapter(&alias) {
            Ok(message) => println!("{}", message),
            Err(e) => {
                if e.leaves_adapter_down() {
                    eprintln!("请手动在“网络连接”中启用 {}", alias);
                }
                return Err(e.into());
            }
        },
        Action::Diagnose => {
            println!("{}", engine.compatibility_report().to_formatted_text());
            if LogManager::is_enabled() {
                println!("日志文件: {}", LogManager::get_current_log_file().display());
            }
        }
        Action::SaveConfig => {
            engine.config().save()?;
            println!("配置已保存");
        }
        Action::Help => println!("{}", USAGE),
    }
    Ok(())
}
