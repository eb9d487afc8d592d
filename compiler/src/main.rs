use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use shc::diag::{DiagLevel, Diagnostic};
use shc::pass::PassId;
use shc::pipeline::{compute_provenance, run_pipeline, CompilationState, EmitOptions};
use shc::vhdl::{Manifest, ManifestEntry, VhdlOptions};

#[derive(Debug, Clone, PartialEq, clap::ValueEnum)]
enum EmitStage {
    /// Analysed program dump (debug form).
    Ast,
    /// Graphviz DOT of the scheduled stream graph.
    Dot,
    /// HLS C sources only.
    C,
    /// C plus VHDL wrappers, top level, test bench, manifest.
    Vhdl,
    /// Everything.
    All,
}

#[derive(Parser, Debug)]
#[command(
    name = "shc",
    version,
    about = "Streamlet HLS Compiler — compiles .str streaming dataflow programs to HLS C and VHDL"
)]
struct Cli {
    /// Input .str source file
    source: PathBuf,

    /// Output directory for emitted artefacts
    #[arg(short, long, default_value = "out")]
    output: PathBuf,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::All)]
    emit: EmitStage,

    /// Top-level entity name (defaults to the source file stem)
    #[arg(long)]
    name: Option<String>,

    /// Test-bench clock period in nanoseconds
    #[arg(long, default_value_t = 10)]
    clk_period: u32,

    /// Cycles the test bench holds reset asserted
    #[arg(long, default_value_t = 4)]
    reset_cycles: u32,

    /// Print compiler phases and timing
    #[arg(long)]
    verbose: bool,
}

// Exit codes: 0 success, 1 parse/semantic error, 2 internal error, 3 I/O.
const EXIT_DIAGNOSTIC: u8 = 1;
const EXIT_INTERNAL: u8 = 2;
const EXIT_IO: u8 = 3;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let source = match std::fs::read_to_string(&cli.source) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("shc: error: cannot read {}: {e}", cli.source.display());
            return ExitCode::from(EXIT_IO);
        }
    };

    if cli.verbose {
        eprintln!("shc: source = {}", cli.source.display());
        eprintln!("shc: output = {}", cli.output.display());
        eprintln!("shc: emit   = {:?}", cli.emit);
    }

    // ── Parse ──
    let parsed = shc::parser::parse(&source);
    if !parsed.errors.is_empty() {
        for error in &parsed.errors {
            let (line, col) = line_col(&source, error.span().start);
            eprintln!("error[E0001]: {error} at {}:{line}:{col}", cli.source.display());
        }
        return ExitCode::from(EXIT_DIAGNOSTIC);
    }
    let Some(program) = parsed.program else {
        eprintln!("shc: error: parser produced no program");
        return ExitCode::from(EXIT_DIAGNOSTIC);
    };

    // ── Run passes ──
    let program_name = cli.name.clone().unwrap_or_else(|| {
        cli.source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "program".to_string())
    });
    let options = EmitOptions {
        vhdl: VhdlOptions {
            clk_period_ns: cli.clk_period,
            reset_cycles: cli.reset_cycles,
            program_name: program_name.clone(),
        },
    };
    let terminal = match cli.emit {
        EmitStage::Ast => PassId::Sema,
        EmitStage::Dot => PassId::BuildGraph,
        EmitStage::C => PassId::EmitC,
        EmitStage::Vhdl | EmitStage::All => PassId::EmitVhdl,
    };

    let mut state = CompilationState::new(program);
    state.provenance = Some(compute_provenance(&source));
    let _ = run_pipeline(&mut state, terminal, &options, cli.verbose, |_, diags| {
        for d in diags {
            report(&source, &cli.source, d);
        }
    });

    if state.has_error {
        let internal = state
            .diagnostics
            .iter()
            .any(|d| d.code.map(|c| c.0) == Some("E0900"));
        return ExitCode::from(if internal { EXIT_INTERNAL } else { EXIT_DIAGNOSTIC });
    }

    // ── Write artefacts ──
    match write_outputs(&cli, &program_name, &state) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("shc: error: {e}");
            ExitCode::from(EXIT_IO)
        }
    }
}

fn write_outputs(
    cli: &Cli,
    program_name: &str,
    state: &CompilationState,
) -> Result<(), std::io::Error> {
    if cli.emit == EmitStage::Ast {
        // Debug dump goes to stdout, no files.
        println!("{:#?}", state.artifacts.sema.as_ref().unwrap());
        return Ok(());
    }

    std::fs::create_dir_all(&cli.output)?;
    let mut manifest_entries = Vec::new();

    if cli.emit == EmitStage::Dot {
        let sema = state.artifacts.sema.as_ref().unwrap();
        let graph = state.artifacts.graph.as_ref().unwrap();
        let path = cli.output.join(format!("{program_name}.dot"));
        std::fs::write(&path, shc::dot::emit_dot(graph, &sema.types))?;
        if cli.verbose {
            eprintln!("shc: wrote {}", path.display());
        }
        return Ok(());
    }

    if let Some(c_code) = &state.artifacts.c_code {
        for file in &c_code.files {
            let path = cli.output.join(&file.filename);
            std::fs::write(&path, &file.source)?;
            manifest_entries.push(ManifestEntry {
                path: file.filename.clone(),
                kind: "hls_c".to_string(),
            });
            if cli.verbose {
                eprintln!("shc: wrote {}", path.display());
            }
        }
    }

    if matches!(cli.emit, EmitStage::Vhdl | EmitStage::All) {
        if let Some(vhdl) = &state.artifacts.vhdl {
            for file in vhdl {
                let path = cli.output.join(&file.filename);
                std::fs::write(&path, &file.source)?;
                let kind = if file.filename.ends_with("_tb.vhd") {
                    "vhdl_tb"
                } else if file.filename == format!("{program_name}.vhd") {
                    "vhdl_top"
                } else {
                    "vhdl_wrapper"
                };
                manifest_entries.push(ManifestEntry {
                    path: file.filename.clone(),
                    kind: kind.to_string(),
                });
                if cli.verbose {
                    eprintln!("shc: wrote {}", path.display());
                }
            }
        }

        let manifest = Manifest {
            program: program_name.to_string(),
            compiler_version: env!("CARGO_PKG_VERSION").to_string(),
            files: manifest_entries,
        };
        let path = cli.output.join("manifest.json");
        std::fs::write(&path, manifest.to_json())?;
        if cli.verbose {
            eprintln!("shc: wrote {}", path.display());
        }
    }

    Ok(())
}

fn report(source: &str, path: &std::path::Path, d: &Diagnostic) {
    use chumsky::span::Span as _;
    let (line, col) = line_col(source, d.span.start());
    let level = match d.level {
        DiagLevel::Error => "error",
        DiagLevel::Warning => "warning",
    };
    match d.code {
        Some(code) => eprintln!("{level}[{code}]: {} at {}:{line}:{col}", d.message, path.display()),
        None => eprintln!("{level}: {} at {}:{line}:{col}", d.message, path.display()),
    }
    if let Some(hint) = &d.hint {
        eprintln!("  hint: {hint}");
    }
    for related in &d.related_spans {
        let (rline, rcol) = line_col(source, related.span.start());
        eprintln!("  note: {} at {rline}:{rcol}", related.label);
    }
}

fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let mut line = 1;
    let mut col = 1;
    for c in source[..offset].chars() {
        if c == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}
