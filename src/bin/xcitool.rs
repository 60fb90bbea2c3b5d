use clap::{Parser, Subcommand};
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;
use xcitool::error::{Error, ResultExt};
use xcitool::format::xci::PartitionKind;
use xcitool::session::Session;
use xcitool::utils::Hexstring;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Opt {
    /// Use development keys (dev.keys) instead of retail ones.
    #[arg(long, global = true)]
    dev: bool,

    /// Key file to use instead of the default locations.
    #[arg(short = 'k', long = "keys", global = true)]
    keyfile: Option<PathBuf>,

    /// Title key file to use instead of the default locations.
    #[arg(long = "titlekeys", global = true)]
    title_keyfile: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Derive every derivable key and print the whole key set.
    Keys,
    /// Open a gamecard image and print a JSON summary of it.
    Info {
        input_file: PathBuf,
    },
    /// Extract the files of one gamecard partition.
    Extract {
        input_file: PathBuf,
        #[arg(value_parser = parse_partition)]
        partition: PartitionKind,
        output_directory: PathBuf,
    },
}

fn parse_partition(name: &str) -> Result<PartitionKind, String> {
    PartitionKind::from_name(name).ok_or_else(|| {
        format!("expected one of update, logo, normal or secure, got {}", name)
    })
}

fn create_session(opt: &Opt) -> Result<Session, Error> {
    let mut session = Session::new(opt.dev);
    session.load_keys(opt.keyfile.as_deref())?;
    session.load_title_keys(opt.title_keyfile.as_deref())?;
    session.preset_internal_keys();
    Ok(session)
}

fn print_keys(session: &Session) -> Result<(), Error> {
    for (name, value) in session.keys().iter_set() {
        println!("{} = {}", name, Hexstring(value));
    }
    Ok(())
}

fn print_info(session: &Session, input_file: &Path) -> Result<(), Error> {
    let xci = session.open_xci_file(input_file).with_path(input_file)?;
    let info = serde_json::to_string_pretty(&xci.info()).map_err(io::Error::from)?;
    println!("{}", info);
    Ok(())
}

fn extract_partition(
    session: &Session,
    input_file: &Path,
    partition: PartitionKind,
    output_directory: &Path,
) -> Result<(), Error> {
    let xci = session.open_xci_file(input_file).with_path(input_file)?;
    let fs = xci.mounted_partition(partition)?;
    fs.extract_to(output_directory)
}

fn process_args(opt: &Opt) {
    let res = create_session(opt).and_then(|session| match &opt.command {
        Command::Keys => print_keys(&session),
        Command::Info { input_file } => print_info(&session, input_file),
        Command::Extract {
            input_file,
            partition,
            output_directory,
        } => extract_partition(&session, input_file, *partition, output_directory),
    });

    if let Err(e) = res {
        println!("Error: {}", e);
        process::exit(1)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("xcitool=info")),
        )
        .init();

    process_args(&Opt::parse());
}
