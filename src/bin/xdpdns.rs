//! daemon entry point: loads the XDP program, wires the data pipeline
//! together and runs until signalled

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use getopts::Options;

use xdpdns::config::Config;
use xdpdns::monitor::{CheckCode, Monitor};
use xdpdns::offload::xdp::{XdpService, DEFAULT_PIN_PATH};
use xdpdns::receiver::cooker::Cooker;
use xdpdns::receiver::notifier::Notifier;
use xdpdns::receiver::pool::TransferPool;
use xdpdns::receiver::verifier::Verifier;
use xdpdns::receiver::watcher::Watcher;
use xdpdns::receiver::zones::ZonesState;
use xdpdns::receiver::Receiver;
use xdpdns::shutdown::ShutdownToken;
use xdpdns::web::server::WebServer;

const DEFAULT_CONFIG: &str = "/etc/xdpdns/xdpdns.yaml";

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

fn log_level(level: &str) -> log::Level {
    match level {
        "trace" => log::Level::Trace,
        "debug" => log::Level::Debug,
        "warn" => log::Level::Warn,
        "error" => log::Level::Error,
        _ => log::Level::Info,
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optopt("c", "config", "configuration file", "FILE");
    opts.optflag("d", "dry-run", "force the cooker into dry-run");
    opts.optflag("x", "disable-api", "disable the admin HTTP API");
    opts.optflag("v", "verbose", "debug level logging");

    let opt_matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    if opt_matches.opt_present("h") {
        print_usage(&program, opts);
        return;
    }

    let config_path = opt_matches
        .opt_str("c")
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());

    let mut config = match Config::load(Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration '{}': {}", config_path, e);
            std::process::exit(1);
        }
    };

    if opt_matches.opt_present("d") {
        config.receiver.cooker.dryrun = true;
    }
    if opt_matches.opt_present("x") {
        config.api.enabled = false;
    }

    let level = if opt_matches.opt_present("v") {
        log::Level::Debug
    } else {
        log_level(&config.log.level)
    };
    simple_logger::init_with_level(level).expect("failed to initialize logger");

    log::info!("xdpdns {} starting", env!("CARGO_PKG_VERSION"));

    let shutdown = ShutdownToken::new();

    // SIGINT/SIGTERM flip the shared token; every loop drains after its
    // current iteration
    {
        let shutdown = shutdown.clone();
        let signals = [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM];
        for signal in signals {
            let shutdown = shutdown.clone();
            if let Err(e) = unsafe {
                signal_hook::low_level::register(signal, move || shutdown.trigger())
            } {
                log::error!("failed to register signal handler: {}", e);
            }
        }
    }

    let pin_path = if !config.receiver.pin_path.is_empty() {
        PathBuf::from(&config.receiver.pin_path)
    } else if !config.offloader.pin_path.is_empty() {
        PathBuf::from(&config.offloader.pin_path)
    } else {
        PathBuf::from(DEFAULT_PIN_PATH)
    };

    // load and attach the datapath first: a broken bpf object or a
    // missing interface is a fatal startup error
    let _xdp = if config.offloader.enabled {
        match XdpService::load(&config.offloader).and_then(|mut xdp| {
            xdp.attach()?;
            Ok(xdp)
        }) {
            Ok(xdp) => {
                log::info!("offloader attached in '{}' mode", xdp.mode());
                Some(xdp)
            }
            Err(e) => {
                log::error!("fatal: offloader failed to start: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let receiver_config = Arc::new(config.receiver.clone());
    let zones = Arc::new(ZonesState::new());
    let monitor = Arc::new(Monitor::new());

    let mut handles = Vec::new();

    if config.receiver.enabled {
        let receiver = Receiver::new(receiver_config.clone(), zones.clone());
        receiver.startup();

        let pool = TransferPool::start(
            receiver_config.clone(),
            zones.clone(),
            shutdown.clone(),
            receiver_config.axfr_transfer.transfer.transfers_in,
        );

        let watcher = Arc::new(Watcher::new(receiver_config.clone(), pin_path.clone()));
        let store = watcher.store();
        handles.extend(watcher.clone().start(shutdown.clone()));

        if config.api.enabled {
            let api = WebServer::new(&config.api.listen, store, monitor.clone(), pin_path.clone());
            let api_shutdown = shutdown.clone();
            if let Ok(handle) = std::thread::Builder::new()
                .name("api-server".to_string())
                .spawn(move || api.run(api_shutdown))
            {
                handles.push(handle);
            }
        }

        if receiver_config.cooker.enabled {
            let cooker = Cooker::new(receiver_config.clone(), zones.clone(), pin_path.clone());
            let cooker_shutdown = shutdown.clone();
            if let Ok(handle) = std::thread::Builder::new()
                .name("cooker".to_string())
                .spawn(move || cooker.run(cooker_shutdown))
            {
                handles.push(handle);
            }
        }

        if receiver_config.verifier.enabled {
            let map_verifier = Verifier::new(receiver_config.clone(), zones.clone(), pin_path.clone());
            let map_shutdown = shutdown.clone();
            if let Ok(handle) = std::thread::Builder::new()
                .name("verifier-map".to_string())
                .spawn(move || map_verifier.run_map_loop(map_shutdown))
            {
                handles.push(handle);
            }

            let blob_verifier =
                Verifier::new(receiver_config.clone(), zones.clone(), pin_path.clone());
            let blob_shutdown = shutdown.clone();
            if let Ok(handle) = std::thread::Builder::new()
                .name("verifier-blob".to_string())
                .spawn(move || blob_verifier.run_blob_loop(blob_shutdown))
            {
                handles.push(handle);
            }
        }

        let notifier = if receiver_config.axfr_transfer.notify.enabled {
            match Notifier::start(
                receiver_config.clone(),
                zones.clone(),
                pin_path.clone(),
                shutdown.clone(),
            ) {
                Ok(notifier) => Some(notifier),
                Err(e) => {
                    log::error!("fatal: notifier failed to start: {}", e);
                    std::process::exit(1);
                }
            }
        } else {
            None
        };

        // liveness check for the monitor consumers
        {
            let monitor = monitor.clone();
            let check_shutdown = shutdown.clone();
            let _ = std::thread::Builder::new()
                .name("monitor-alive".to_string())
                .spawn(move || loop {
                    monitor.publish("receiver-alive", "xdpdns", 300, CheckCode::Ok, "running");
                    if check_shutdown.wait(std::time::Duration::from_secs(60)) {
                        return;
                    }
                });
        }

        // the receiver tick runs on the main thread until shutdown
        receiver.run(&pool, shutdown.clone());

        pool.stop();
        if let Some(notifier) = notifier {
            notifier.stop();
        }
    } else {
        log::info!("receiver disabled, idling until signalled");
        while !shutdown.wait(std::time::Duration::from_secs(1)) {}
    }

    for handle in handles {
        let _ = handle.join();
    }

    log::info!("xdpdns stopped");
}
