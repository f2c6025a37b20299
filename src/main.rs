use anyhow::{bail, Context, Result};
use clap::{Arg, ArgAction, Command};
use log::info;
use resp_client::{Client, ClientConfig, ProtocolVersion};

/// Runs one command against a server and prints the reply, redis-cli style.
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let (config, args) = config_from_cli()?;
    let client = Client::connect(config)
        .await
        .context("Failed to connect to server")?;

    let reply = client.custom_command(&args).await;
    client.close();

    match reply {
        Ok(reply) => println!("{reply}"),
        Err(e) if e.is_request() => println!("(error) {e}"),
        Err(e) => return Err(e).context("Command failed"),
    }
    Ok(())
}

fn config_from_cli() -> Result<(ClientConfig, Vec<String>)> {
    let matches = Command::new("resp-cli")
        .arg(
            Arg::new("host")
                .short('H')
                .long("host")
                .value_name("HOST")
                .help("Server hostname")
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Server port")
                .default_value("6379"),
        )
        .arg(
            Arg::new("db")
                .short('n')
                .long("db")
                .value_name("INDEX")
                .help("Database to select after connecting")
                .default_value("0"),
        )
        .arg(
            Arg::new("user")
                .long("user")
                .value_name("USERNAME")
                .help("ACL username, used together with --pass"),
        )
        .arg(
            Arg::new("pass")
                .short('a')
                .long("pass")
                .value_name("PASSWORD")
                .help("Password used to authenticate the connection"),
        )
        .arg(
            Arg::new("name")
                .long("name")
                .value_name("CLIENT_NAME")
                .help("Name reported by CLIENT SETNAME"),
        )
        .arg(
            Arg::new("resp3")
                .long("resp3")
                .action(ArgAction::SetTrue)
                .help("Speak RESP3 (HELLO 3)"),
        )
        .arg(
            Arg::new("command")
                .value_name("COMMAND")
                .num_args(1..)
                .trailing_var_arg(true)
                .help("Command and arguments, e.g. GET key"),
        )
        .get_matches();

    let host = matches
        .get_one::<String>("host")
        .context("host has a default")?;
    let port: u16 = matches
        .get_one::<String>("port")
        .context("port has a default")?
        .parse()
        .context("Invalid port")?;
    let db: u32 = matches
        .get_one::<String>("db")
        .context("db has a default")?
        .parse()
        .context("Invalid database index")?;

    let mut config = ClientConfig::new()
        .with_address(host.clone(), port)
        .with_database_id(db);
    if let Some(password) = matches.get_one::<String>("pass") {
        config = config.with_credentials(matches.get_one::<String>("user").cloned(), password.clone());
    }
    if let Some(name) = matches.get_one::<String>("name") {
        config = config.with_client_name(name.clone());
    }
    if matches.get_flag("resp3") {
        config = config.with_protocol(ProtocolVersion::Resp3);
    }

    let args: Vec<String> = matches
        .get_many::<String>("command")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    if args.is_empty() {
        bail!("No command given");
    }

    info!("{} -> {:?}", config.nodes()[0], args);
    Ok((config, args))
}
