use clap::Parser;
use linerpc::{
    ClientConfig, DispatchRegistry, MemoryCoordinator, RpcClient, RpcServer, ServerConfig,
    ServiceRegistry,
};
use linerpc_demo::{User, UserRemote};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Number of in-process servers.
    #[arg(long, default_value = "2")]
    pub servers: usize,

    /// Pool slots each server asks for.
    #[arg(long, default_value = "1")]
    pub weight: u32,

    /// Registry path the servers publish under.
    #[arg(long, default_value = "/servers")]
    pub service_path: String,

    /// Enable stress testing.
    #[arg(long, default_value_t = false)]
    pub stress: bool,

    /// Stress testing duration.
    #[arg(long, default_value = "60")]
    pub secs: u64,

    /// The number of coroutines.
    #[arg(long, default_value = "32")]
    pub coroutines: usize,
}

#[derive(Default)]
struct State {
    total: AtomicUsize,
    fails: AtomicUsize,
}

async fn stress_test(client: &Arc<RpcClient>, args: &Args) {
    let state = Arc::new(State::default());
    let start_time = std::time::Instant::now();
    let mut tasks = vec![];
    for c in 0..args.coroutines {
        let save_user = client.stub::<User, User>(UserRemote::SAVE_USER);
        let state = state.clone();
        let secs = args.secs;
        tasks.push(tokio::spawn(async move {
            let mut n = 0u64;
            while start_time.elapsed().as_secs() < secs {
                for _ in 0..256 {
                    n += 1;
                    let user = User {
                        id: n,
                        name: format!("user-{c}-{n}"),
                    };
                    let result = save_user.invoke(&user).await;
                    state.total.fetch_add(1, Ordering::AcqRel);
                    if result.is_err() {
                        state.fails.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
        }));
    }
    tokio::select! {
        _ = async {
            for task in tasks {
                let _ = task.await;
            }
        } => {
        }
        _ = async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let total = state.total.swap(0, Ordering::AcqRel);
                let fails = state.fails.swap(0, Ordering::AcqRel);
                tracing::info!("QPS: {total}/s, fails: {fails}/s");
            }
        } => {
        }
    }
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> linerpc::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let coordinator = MemoryCoordinator::new();

    let mut servers = vec![];
    for _ in 0..args.servers {
        let mut registry = DispatchRegistry::default();
        registry.export(Arc::new(UserRemote::default()))?;
        let config = ServerConfig {
            weight: args.weight,
            service_path: args.service_path.clone(),
            ..Default::default()
        };
        let server = Arc::new(
            RpcServer::create(registry, config)
                .with_registry(ServiceRegistry::new(coordinator.session())),
        );
        let addr = server
            .listen(std::net::SocketAddr::from(([127, 0, 0, 1], 0)))
            .await?;
        tracing::info!("serving saveUser/saveUsers on {addr}");
        servers.push(server);
    }

    let config = ClientConfig {
        timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let client = RpcClient::create(config, ServiceRegistry::new(coordinator.session()));
    client.start(&args.service_path).await?;
    tracing::info!("client pool holds {} connections", client.pool().len());

    if args.stress {
        stress_test(&client, &args).await;
    } else {
        let user = User {
            id: 1,
            name: "John doe".into(),
        };
        let saved = client.stub::<User, User>(UserRemote::SAVE_USER).invoke(&user).await?;
        tracing::info!("saveUser: {saved:?}");

        let users = vec![
            User {
                id: 2,
                name: "Jane doe".into(),
            },
            User {
                id: 3,
                name: "Richard roe".into(),
            },
        ];
        let rsp = client
            .stub::<Vec<User>, Vec<User>>(UserRemote::SAVE_USERS)
            .call(&users)
            .await;
        tracing::info!("saveUsers: {}", serde_json::to_string(&rsp).unwrap_or_default());
    }

    client.stop();
    for server in &servers {
        server.shutdown().await;
    }
    for server in &servers {
        server.join().await;
    }
    Ok(())
}
