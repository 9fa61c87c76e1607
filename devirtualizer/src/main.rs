mod engine;

use std::{fs, path::PathBuf, process};

use clap::Parser;
use lifter::{
    classifier::{parse_address, OpcodeMap},
    config::LifterConfig,
    error::Result,
};
use logger::{error, info};

use crate::engine::{Engine, Image};

#[derive(Parser, Debug)]
#[command(version, about = "Lifts VM-protected routines back into analyzable IR")]
struct Args {
    /// Protected PE image
    input: PathBuf,

    /// Virtual address of the routine's VM entry stub
    #[arg(long, value_parser = parse_va)]
    routine: u64,

    /// Overrides the image base from the PE header
    #[arg(long, value_parser = parse_va)]
    image_base: Option<u64>,

    /// TOML file mapping handler addresses to opcode names
    #[arg(long)]
    opcode_map: Option<PathBuf>,

    #[arg(long, default_value = "output.ll")]
    graph_output: PathBuf,

    #[arg(long, default_value = "output.vrtn")]
    routine_output: PathBuf,

    #[arg(long, default_value_t = 2048)]
    vstack_size: usize,

    #[arg(short, long)]
    verbose: bool,
}

fn parse_va(text: &str) -> std::result::Result<u64, String> {
    parse_address(text).map_err(|err| err.to_string())
}

fn run(args: Args) -> Result<()> {
    let image = Image::load(&args.input)?;

    let opcode_map = match &args.opcode_map {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            let map = OpcodeMap::from_toml(&content)?;
            info!("Loaded {} handler addresses from '{}'", map.len(), path.display());
            map
        }
        None => OpcodeMap::default(),
    };

    let config = LifterConfig {
        image_base: args.image_base.unwrap_or(image.image_base()),
        vstack_size: args.vstack_size,
        opcode_map,
        ..Default::default()
    };

    let engine = Engine::new(image, config)?;
    let lifted = engine.lift(args.routine)?;

    let text = lifted.module.to_string();
    print!("{}", text);

    fs::write(&args.graph_output, &text)?;
    info!("Wrote graph to '{}'", args.graph_output.display());

    fs::write(&args.routine_output, lifted.routine.encode())?;
    info!(
        "Wrote {} routine blocks to '{}'",
        lifted.routine.len(),
        args.routine_output.display()
    );

    Ok(())
}

fn main() {
    let args = Args::parse();

    logger::set_verbose(args.verbose);

    if let Err(err) = run(args) {
        error!("{}", err);
        process::exit(1);
    }
}
