use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use dsplc::backend::{CompileFlags, Value};
use dsplc::eval::ReferenceBackend;
use dsplc::fixture::{Outcome, Runner};
use dsplc::pipeline::{CompileUnit, PipelineError};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    Ast,
    Typed,
    Graph,
    Run,
    Test,
}

#[derive(Parser, Debug)]
#[command(
    name = "dsplc",
    version,
    about = "DSP language compiler front end — type checks .dsp sources and runs them on the reference backend"
)]
struct Cli {
    /// Input .dsp source file
    source: PathBuf,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Run)]
    emit: EmitStage,

    /// Function to call, or `{Node}` to process a node
    #[arg(long, default_value = "main")]
    entry: String,

    /// Argument for the entry function (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Channels processed when the entry is a node
    #[arg(long, default_value_t = 2)]
    channels: usize,

    /// Optimisation flags, e.g. "Inlining LoopOptimisation" or "All"
    #[arg(long, default_value = "All")]
    flags: String,

    /// Active voice for PolyData
    #[arg(long)]
    voice_index: Option<usize>,

    /// Print compiler phases and timing
    #[arg(long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "dsplc=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// `1` is an int, `1.5` a double, `1.5f` a float.
fn parse_arg(s: &str) -> Option<Value> {
    match s {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        _ => {}
    }
    if let Ok(i) = s.parse::<i32>() {
        return Some(Value::Int(i));
    }
    if let Some(f) = s.strip_suffix('f') {
        return f.parse::<f32>().ok().map(Value::Float);
    }
    s.parse::<f64>().ok().map(Value::Double)
}

fn report(unit: &CompileUnit, e: &PipelineError) {
    for (m, d) in e.messages.iter().zip(&e.diagnostics) {
        eprintln!("{}", m);
        if let Some(hint) = &d.hint {
            eprintln!("  hint: {}", hint);
        }
        for r in &d.related_spans {
            let (line, col) = unit.position(r.span.start);
            eprintln!("  note: Line {}({}): {}", line, col, r.label);
        }
    }
}

fn node_name(entry: &str) -> Option<String> {
    entry
        .starts_with('{')
        .then(|| entry.chars().filter(|c| !"{} \t".contains(*c)).collect())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let flags: CompileFlags = match cli.flags.parse() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("dsplc: error: {}", e);
            return ExitCode::from(2);
        }
    };

    let unit = match CompileUnit::from_file(&cli.source) {
        Ok(u) => u.with_flags(flags),
        Err(e) => {
            eprintln!("dsplc: error: {}", e);
            return ExitCode::from(2);
        }
    };

    if let EmitStage::Test = cli.emit {
        let runner = Runner { active: flags };
        return match runner.run_source(unit.name(), unit.source()) {
            Ok(Outcome::Passed) => {
                println!("{}: ok", cli.source.display());
                ExitCode::SUCCESS
            }
            Ok(Outcome::Skipped(why)) => {
                println!("{}: skipped ({})", cli.source.display(), why);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {}", cli.source.display(), e);
                ExitCode::FAILURE
            }
        };
    }

    if let EmitStage::Ast = cli.emit {
        return match unit.parse() {
            Ok(ast) => {
                println!("{:#?}", ast);
                ExitCode::SUCCESS
            }
            Err(e) => {
                report(&unit, &e);
                ExitCode::FAILURE
            }
        };
    }

    let node = node_name(&cli.entry);
    let unit = match &node {
        Some(n) => unit.with_entry_node(n.clone(), cli.channels),
        None => unit,
    };
    let compiled = match unit.compile() {
        Ok(c) => c,
        Err(e) => {
            report(&unit, &e);
            return ExitCode::FAILURE;
        }
    };

    match cli.emit {
        EmitStage::Typed => {
            let prog = &compiled.program;
            for f in prog.functions.iter().filter(|f| f.body.is_some()) {
                let params: Vec<String> = f.params.iter().map(|p| p.ty.ty.display(prog)).collect();
                println!("{} {}({})", f.ret.ty.display(prog), f.name, params.join(", "));
            }
            for s in &prog.structs {
                println!("struct {} ({} fields)", s.name, s.fields.len());
            }
            ExitCode::SUCCESS
        }
        EmitStage::Graph => match compiled.graph_json() {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("dsplc: error: {}", e);
                ExitCode::FAILURE
            }
        },
        EmitStage::Run => {
            let mut args = Vec::with_capacity(cli.args.len());
            for a in &cli.args {
                match parse_arg(a) {
                    Some(v) => args.push(v),
                    None => {
                        eprintln!("dsplc: error: can't parse argument '{}'", a);
                        return ExitCode::from(2);
                    }
                }
            }
            let mut backend = ReferenceBackend;
            let result = compiled.instantiate(&mut backend).and_then(|mut u| {
                u.set_voice_index(cli.voice_index);
                match &node {
                    Some(n) => {
                        // Impulse response of one short block.
                        let mut data = vec![vec![0.0f32; 16]; cli.channels];
                        for ch in &mut data {
                            ch[0] = 1.0;
                        }
                        u.process_node(n, &mut data, &[])?;
                        Ok(Value::List(
                            data.into_iter()
                                .map(|ch| Value::List(ch.into_iter().map(Value::Float).collect()))
                                .collect(),
                        ))
                    }
                    None => u.call(&cli.entry, &args),
                }
            });
            match result {
                Ok(v) => {
                    println!("{}", v);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("dsplc: error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        EmitStage::Ast | EmitStage::Test => ExitCode::SUCCESS,
    }
}
