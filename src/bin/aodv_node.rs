#[macro_use]
extern crate slog;
extern crate aodv_router;

use aodv_router::logging;
use aodv_router::node::node_config::NodeConfig;
use aodv_router::node::{Event, Node};
use aodv_router::{AodvError, AodvErrorKind};
use clap::{App, Arg, ArgMatches};
use crossbeam_channel::Sender;
use std::io::{self, BufRead};
use std::net::Ipv4Addr;
use std::{env, fs, thread};

const ARG_CONFIG: &str = "config";
const ARG_NODE_NAME: &str = "node_name";
const ARG_WORK_DIR: &str = "work_dir";
const ARG_TERMINAL_LOG: &str = "term_log";
const VERSION: &str = env!("CARGO_PKG_VERSION");
const CONFIG_FILE_NAME: &str = "node.toml";
const ERROR_EXECUTION_FAILURE: i32 = 1;
const ERROR_INITIALIZATION: i32 = 2;

/// Commands accepted on standard input.
#[derive(Debug, PartialEq)]
enum Command {
    Send(Ipv4Addr, String),
    Routes,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let mut parts = line.splitn(3, ' ');
    match parts.next() {
        Some("send") => {
            let dest = parts
                .next()
                .ok_or_else(|| String::from("usage: send <address> <text>"))?;
            let dest = dest
                .parse::<Ipv4Addr>()
                .map_err(|e| format!("Invalid address {}: {}", dest, e))?;
            let text = parts.next().unwrap_or("").to_string();
            Ok(Command::Send(dest, text))
        }
        Some("routes") => Ok(Command::Routes),
        Some("quit") | Some("exit") => Ok(Command::Quit),
        _ => Err(format!("Unknown command: {}", line)),
    }
}

/// Reads commands from stdin and feeds them into the node's event loop.
fn spawn_command_reader(events: Sender<Event>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            let event = match parse_command(&line) {
                Ok(Command::Send(destination, text)) => Event::Send {
                    destination,
                    payload: text.into_bytes(),
                },
                Ok(Command::Routes) => Event::ShowRoutes,
                Ok(Command::Quit) => Event::Shutdown,
                Err(e) => {
                    eprintln!("{}", e);
                    continue;
                }
            };
            let quit = match event {
                Event::Shutdown => true,
                _ => false,
            };
            if events.send(event).is_err() || quit {
                break;
            }
        }
        //EOF on stdin stops the node as well
        let _res = events.send(Event::Shutdown);
    })
}

fn run(config: NodeConfig) -> Result<(), AodvError> {
    let log_file_name = format!(
        "{}{}{}{}{}.log",
        &config.work_dir,
        std::path::MAIN_SEPARATOR,
        logging::LOG_DIR_NAME,
        std::path::MAIN_SEPARATOR,
        &config.node_name
    );
    let logger = logging::create_logger(&log_file_name, config.term_log).unwrap_or_else(|e| {
        println!("aodv_node failed with the following error: {}", e);
        ::std::process::exit(ERROR_INITIALIZATION);
    });

    info!(logger, "Node Config: {:?}", &config);
    let mut node = Node::new(config, logger)?;
    let _reader = spawn_command_reader(node.event_sender());
    node.run()
}

fn get_cli_parameters<'a>() -> ArgMatches<'a> {
    App::new("aodv_node").version(VERSION)
                         .about("Runs an AODV router on the given network interfaces")
                         .arg(Arg::with_name(ARG_CONFIG)
                               .short("c")
                               .long("config")
                               .value_name("FILE")
                               .help("Configuration file for the node.")
                               .takes_value(true))
                         .arg(Arg::with_name(ARG_NODE_NAME)
                               .short("n")
                               .long("node_name")
                               .value_name("NAME")
                               .help("Name of the node. Overrides the configuration file.")
                               .takes_value(true))
                         .arg(Arg::with_name(ARG_WORK_DIR)
                               .short("d")
                               .long("work_dir")
                               .value_name("DIR")
                               .help("Operating directory for the program, where logs will be placed.")
                               .takes_value(true))
                         .arg(Arg::with_name(ARG_TERMINAL_LOG)
                               .short("l")
                               .long("log_to_terminal")
                               .value_name("true/false")
                               .help("Should this node log operations to the terminal as well")
                               .takes_value(true))
                         .get_matches()
}

fn validate_config(config: &mut NodeConfig, matches: &ArgMatches) -> Result<(), AodvError> {
    if let Some(name) = matches.value_of(ARG_NODE_NAME) {
        config.node_name = name.to_string();
    }

    //work_dir
    config.work_dir = matches
        .value_of(ARG_WORK_DIR)
        .unwrap_or_else(|| config.work_dir.as_str())
        .to_string();
    let dir_info = fs::metadata(std::path::Path::new(config.work_dir.as_str())).map_err(|e| {
        let err_msg = String::from("work_dir is not a valid directory");
        AodvError {
            kind: AodvErrorKind::Configuration(err_msg),
            cause: Some(Box::new(e)),
        }
    })?;
    if !dir_info.is_dir() || dir_info.permissions().readonly() {
        let err_msg = String::from("work_dir is not a valid directory or it's not writable");
        return Err(AodvErrorKind::Configuration(err_msg).into());
    }

    // Log to terminal
    if let Some(v) = matches.value_of(ARG_TERMINAL_LOG) {
        config.term_log = v.parse::<bool>().unwrap_or(false);
    }

    config.validate()
}

/// Reads the configuration file and applies the command line overrides.
fn init(matches: &ArgMatches) -> Result<NodeConfig, AodvError> {
    let config_file_path = match matches.value_of(ARG_CONFIG) {
        Some(path) => std::path::PathBuf::from(path),
        None => {
            //No configuration file was passed. Look for default option: current_dir + default name.
            let mut current_dir = env::current_dir().map_err(|e| {
                let err_msg = String::from("Failed to read current directory");
                AodvError {
                    kind: AodvErrorKind::Configuration(err_msg),
                    cause: Some(Box::new(e)),
                }
            })?;
            current_dir.push(CONFIG_FILE_NAME);
            current_dir
        }
    };
    let mut configuration = NodeConfig::from_file(&config_file_path)?;
    validate_config(&mut configuration, matches)?;

    Ok(configuration)
}

fn main() {
    //Enable the a more readable version of backtraces
    color_backtrace::install();

    //Get the CLI parameters
    let matches = get_cli_parameters();

    //Initialization
    let config = init(&matches).unwrap_or_else(|e| {
        println!("aodv_node failed with the following error: {}", e);
        std::process::exit(ERROR_INITIALIZATION);
    });

    //Main loop
    if let Err(ref e) = run(config) {
        eprintln!("aodv_node failed with the following error: {}", e);
        std::process::exit(ERROR_EXECUTION_FAILURE);
    }
}
