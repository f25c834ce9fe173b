use casualchain_daemon::{
    config::{ConfigStore, NodeArgs, NodeConfig},
    core::{
        datastore::{MemoryDatastore, SharedDatastore, SledDatastore},
        keyring::Keyring,
        CoreContext, ModuleCondition,
    },
    internode::InternodeModule,
    rest::{self, RequestGate, RestState},
};
use casualchain_common::error::ErrorKind;
use clap::Parser;
use log::{error, info, warn};
use std::{path::PathBuf, process::exit, str::FromStr, sync::Arc};
use tokio::net::TcpListener;

// Startup failures abort with distinct codes; runtime failures never do.
const EXIT_CONFIG: i32 = 2;
const EXIT_LOGGER: i32 = 3;
const EXIT_KEYRING: i32 = 4;
const EXIT_DATASTORE: i32 = 5;
const EXIT_BIND: i32 = 6;

fn setup_logger(args: &NodeArgs) -> Result<(), fern::InitError> {
    use fern::colors::{Color, ColoredLevelConfig};

    let level = log::LevelFilter::from_str(&args.log_level).unwrap_or(log::LevelFilter::Info);
    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Magenta)
        .trace(Color::BrightBlack);

    let mut dispatch = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("sled", log::LevelFilter::Warn)
        .level_for("actix_server", log::LevelFilter::Warn)
        .chain(std::io::stdout());

    if !args.disable_file_logging {
        std::fs::create_dir_all(&args.logs_path)?;
        let path = PathBuf::from(&args.logs_path).join(&args.filename_log);
        dispatch = dispatch.chain(fern::log_file(path)?);
    }
    dispatch.apply()?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = NodeArgs::parse();

    if let Err(e) = setup_logger(&args) {
        eprintln!("logger setup failed: {}", e);
        exit(EXIT_LOGGER);
    }

    let config_path = PathBuf::from(&args.config_file);
    let mut config = match NodeConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            exit(EXIT_CONFIG);
        }
    };
    if let Some(mode) = args.node_mode {
        config.system.node_mode = mode;
    }
    info!(
        "starting node {} in {} mode",
        config.internode.self_name, config.system.node_mode
    );

    let keyring = match Keyring::init(&config.keyring, &config.internode.self_name) {
        Ok(keyring) => Arc::new(keyring),
        Err(e) => {
            error!("{}", e);
            exit(EXIT_KEYRING);
        }
    };

    let datastore: SharedDatastore = if config.system.node_mode.is_testing() {
        info!("testing mode: using the in-memory datastore");
        Arc::new(MemoryDatastore::new(&config.system.administration_id))
    } else {
        match SledDatastore::open(&config.datastore, &config.system.administration_id) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("{}", e);
                exit(EXIT_DATASTORE);
            }
        }
    };

    let listener = match TcpListener::bind((
        config.internode.self_host.as_str(),
        config.internode.self_port,
    ))
    .await
    {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                "internode bind {}:{} failed: {}",
                config.internode.self_host, config.internode.self_port, e
            );
            exit(EXIT_BIND);
        }
    };

    let internode = Arc::new(InternodeModule::new(&config.internode));
    let conf_store = Arc::new(ConfigStore::new(config_path, config.clone()));
    let ctx = CoreContext::new(
        conf_store,
        &config,
        datastore,
        keyring,
        internode.clone(),
    );
    ctx.set_condition("datastore", ModuleCondition::Active).await;
    ctx.set_condition("keyring", ModuleCondition::Active).await;

    let server_task = tokio::spawn(internode.clone().run_server(ctx.clone(), listener));
    ctx.set_condition("internode", ModuleCondition::Active).await;

    if let Err(e) = internode.wait_for_nodes().await {
        warn!("starting without the full peer set: {}", e.detail);
    }

    if config.system.node_mode.wants_init() {
        // keys first: peers must be able to verify the genesis broadcast
        if let Err(e) = ctx.keyring.post_self_public_keys(&ctx).await {
            warn!("init: publishing own key failed: {}", e);
        }
        match ctx.system.post_genesis_block(&ctx).await {
            Ok(created) => info!("init: {} genesis blocks created", created.len()),
            Err(e) if e.kind == ErrorKind::ConflictingBlock => {
                info!("init: genesis already in place")
            }
            Err(e) => warn!("init: genesis creation failed: {}", e),
        }
    }

    if config.system.enable_internaltasks {
        if let Err(e) = ctx.event.register_internal_events(&config.event).await {
            error!("event registration failed: {}", e);
        }
    }
    let event_task = {
        let ctx = ctx.clone();
        tokio::spawn(async move { ctx.event.run(&ctx).await })
    };
    ctx.set_condition("event", ModuleCondition::Active).await;

    let gate = Arc::new(RequestGate::new());
    let state = Arc::new(RestState {
        ctx: ctx.clone(),
        gate: gate.clone(),
    });
    let user_server = match rest::user::start_user_api(state.clone(), config.rest.userapi_port) {
        Ok(server) => server,
        Err(e) => {
            error!("user API bind on {} failed: {}", config.rest.userapi_port, e);
            exit(EXIT_BIND);
        }
    };
    let admin_server = match rest::admin::start_admin_api(state, config.rest.adminapi_port) {
        Ok(server) => server,
        Err(e) => {
            error!("admin API bind on {} failed: {}", config.rest.adminapi_port, e);
            exit(EXIT_BIND);
        }
    };
    let user_handle = user_server.handle();
    let admin_handle = admin_server.handle();
    tokio::spawn(user_server);
    tokio::spawn(admin_server);
    info!(
        "listening: user API :{}, admin API :{}, internode :{}",
        config.rest.userapi_port, config.rest.adminapi_port, config.internode.self_port
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal handling failed: {}", e);
    }
    info!("shutdown requested");

    // teardown leaves-first: listeners, events, channels, datastore last
    rest::shutdown(&gate, user_handle, admin_handle).await;
    ctx.event.stop();
    ctx.event.unregister_all_internal_events().await;
    event_task.abort();
    internode.shutdown().await;
    server_task.abort();
    if let Err(e) = ctx.datastore.flush().await {
        warn!("final datastore flush failed: {}", e);
    }
    info!("node stopped");
}
