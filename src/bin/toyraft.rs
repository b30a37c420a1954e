/*
 * toyraft boots a simulated Raft cluster inside a single process: N nodes
 * connected by an in-memory network with injected message loss and latency.
 * It waits for a leader, submits a batch of commands, lets them replicate,
 * and writes each node's applied entries to one file per node so the results
 * can be compared across the cluster.
 */

#![warn(clippy::all)]

use std::path::PathBuf;
use std::time::Duration;

use toyraft::error::Result;
use toyraft::raft::{FileSink, Memory, Node, NodeID, Options};

fn main() -> Result<()> {
    let args = clap::command!()
        .about("Runs a simulated Raft cluster and records each node's applied log")
        .arg(
            clap::Arg::new("nodes")
                .short('n')
                .long("nodes")
                .help("Number of cluster nodes")
                .value_parser(clap::value_parser!(u8).range(1..=64))
                .default_value("5"),
        )
        .arg(
            clap::Arg::new("commands")
                .short('c')
                .long("commands")
                .help("Number of commands to submit")
                .value_parser(clap::value_parser!(u32))
                .default_value("10"),
        )
        .arg(
            clap::Arg::new("dir")
                .short('d')
                .long("dir")
                .help("Directory for per-node applied logs")
                .default_value("data"),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("log-level")
                .help("Log level (off, error, warn, info, debug, trace)")
                .default_value("info"),
        )
        .get_matches();

    let nodes = *args.get_one::<u8>("nodes").unwrap();
    let commands = *args.get_one::<u32>("commands").unwrap();
    let dir = PathBuf::from(args.get_one::<String>("dir").unwrap());

    let log_level = args.get_one::<String>("log_level").unwrap().parse()?;
    simplelog::SimpleLogger::init(log_level, simplelog::Config::default())?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(run(nodes, commands, dir))
}

/// Boots the cluster, submits the commands, and waits for them to replicate.
async fn run(nodes: u8, commands: u32, dir: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&dir)?;

    let net = Memory::default();
    let (ready_tx, ready_rx) = tokio::sync::watch::channel(false);

    let ids: Vec<NodeID> = (0..nodes).collect();
    let mut cluster = Vec::new();
    for id in ids.iter().copied() {
        let peers = ids.iter().copied().filter(|peer| *peer != id).collect();
        let sink = FileSink::new(dir.join(format!("node-{id}.log")))?;
        let node = Node::new(
            id,
            peers,
            net.endpoint(id),
            Box::new(sink),
            Options::default(),
            ready_rx.clone(),
        );
        net.register(id, node.clone());
        cluster.push(node);
    }
    drop(ready_rx);
    ready_tx.send(true).expect("cluster nodes dropped");

    // Submit each command to the current leader, waiting for one to emerge.
    let mut submitted = 0;
    while submitted < commands {
        let leader = wait_leader(&cluster).await;
        let command = format!("set x = {}", submitted + 1);
        match leader.submit(command.clone().into_bytes()) {
            Ok(index) => {
                println!("node {} accepted {command:?} at index {index}", leader.id());
                submitted += 1;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            // The leader changed between discovery and submission; try again.
            Err(_) => continue,
        }
    }

    // Give the cluster time to replicate and apply everything, then report.
    tokio::time::sleep(Duration::from_secs(10)).await;
    for node in &cluster {
        let status = node.status();
        let role = if status.leader { "leader" } else { "follower" };
        println!("node {} finished in term {} as {role}", status.id, status.term);
        node.kill();
    }
    println!("applied logs written to {}", dir.display());
    Ok(())
}

/// Polls the cluster until some node considers itself the leader.
async fn wait_leader(cluster: &[Node]) -> &Node {
    loop {
        if let Some(node) = cluster.iter().find(|node| node.status().leader) {
            return node;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
