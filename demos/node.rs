use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;

use meshlink::config::{MeshConfig, ServerConfig};
use meshlink::protocol::ComponentDescriptor;
use meshlink::Builder;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Name of this node.
    #[arg(short, long)]
    name: String,
    /// Accept links on this address.
    /// example: --listen 0.0.0.0:23333
    #[arg(short, long)]
    listen: Option<SocketAddr>,
    /// Keep a link to a peer.
    /// example: --server n2=tcp://192.168.10.13:23333=secret
    #[arg(short, long)]
    server: Vec<String>,
    /// Let a peer in.
    /// example: --auth n3=secret
    #[arg(short, long)]
    auth: Vec<String>,
    /// Host or remotely register a component.
    /// example: --component 'n1/web:tcp:{"listen":"127.0.0.1:8080","pass":"n2/out"}'
    #[arg(short, long)]
    component: Vec<String>,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let Args {
        name,
        listen,
        server,
        auth,
        component,
    } = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let mut config = MeshConfig::new(name);
    if let Some(listen) = listen {
        config = config.set_listen(listen);
    }
    for server in server {
        let mut split = server.splitn(3, '=');
        let (Some(name), Some(addr), Some(token)) = (split.next(), split.next(), split.next())
        else {
            anyhow::bail!("--server expects name=addr=token, got {server}");
        };
        config = config.add_server(ServerConfig::new(name, addr, token));
    }
    for auth in auth {
        let (peer, token) = auth
            .split_once('=')
            .with_context(|| format!("--auth expects peer=token, got {auth}"))?;
        config = config.add_auth(peer, token);
    }
    for component in component {
        let mut split = component.splitn(3, ':');
        let name = split
            .next()
            .unwrap_or_default()
            .parse()
            .with_context(|| format!("--component {component}"))?;
        let kind = split
            .next()
            .with_context(|| format!("--component {component} has no type"))?;
        let mut descriptor = ComponentDescriptor::new(name, kind);
        if let Some(options) = split.next() {
            let options = serde_json::from_str(options)
                .with_context(|| format!("--component {component} has bad options"))?;
            descriptor = descriptor.with_options(options);
        }
        config = config.add_component(descriptor);
    }

    let (tx, mut quit) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc2::set_async_handler(async move {
        tx.send(()).await.expect("Signal error");
    })
    .await;

    let mesh = Builder::new(config).build().await?;
    let handle = mesh.handle();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            match handle.routes().await {
                Ok(routes) => {
                    for route in routes {
                        log::info!(
                            "route {} distance={} next={}",
                            route.destination,
                            route.distance,
                            route.next
                        );
                    }
                }
                Err(_) => break,
            }
        }
    });
    quit.recv().await;
    log::info!("exit!!!!");
    mesh.shutdown().await;
    Ok(())
}
