use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use weft_compiler::compile_source;
use weft_core::{ChoiceBuffer, Package, StrHash, VarKey, Variant};
use weft_runtime::{Director, EnginePlugin, HostFlow, ThreadHandle};

mod dump;

#[derive(Parser)]
#[command(name = "weft", about = "Compile and play weft narrative scripts", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a script source file into a package.
    Compile {
        input: PathBuf,
        /// Output path; defaults to the input with a .weftpkg extension.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Module name; defaults to the input file stem.
        #[arg(long)]
        name: Option<String>,
    },
    /// Print a package's node directory and disassembled instructions.
    Dump { input: PathBuf },
    /// Run a package interactively in the terminal.
    Play {
        input: PathBuf,
        /// Entry node; defaults to `<module>.main`.
        #[arg(long)]
        start: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    match Cli::parse().command {
        Command::Compile {
            input,
            output,
            name,
        } => compile_cmd(&input, output, name),
        Command::Dump { input } => {
            let pkg = load_package(&input)?;
            dump::dump_package(&pkg, &mut io::stdout().lock())
        }
        Command::Play { input, start } => play_cmd(&input, start),
    }
}

fn module_name(path: &Path, explicit: Option<String>) -> String {
    explicit.unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "main".to_string())
    })
}

/// Script sources compile on the fly; anything else loads as a package.
fn load_package(path: &Path) -> Result<Package> {
    let is_source = path
        .extension()
        .is_some_and(|e| e == "weft" || e == "txt");
    if is_source {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let file = path.to_string_lossy();
        let (pkg, warnings) = compile_source(&file, &module_name(path, None), &text)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        for w in &warnings {
            log::warn!("{}:{}: {}", w.file, w.line, w.message);
        }
        Ok(pkg)
    } else {
        Package::load_from_file(path).with_context(|| format!("load {}", path.display()))
    }
}

fn compile_cmd(input: &Path, output: Option<PathBuf>, name: Option<String>) -> Result<()> {
    let text =
        std::fs::read_to_string(input).with_context(|| format!("read {}", input.display()))?;
    let file = input.to_string_lossy();
    let (pkg, warnings) = compile_source(&file, &module_name(input, name), &text)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    for w in &warnings {
        eprintln!("warning: {}:{}: {}", w.file, w.line, w.message);
    }
    let output = output.unwrap_or_else(|| input.with_extension("weftpkg"));
    pkg.save_to_file(&output)
        .with_context(|| format!("write {}", output.display()))?;
    println!(
        "compiled '{}': {} node(s), {} line(s), {} bytes of code -> {}",
        pkg.name(),
        pkg.node_count(),
        pkg.line_count(),
        pkg.code().len(),
        output.display()
    );
    Ok(())
}

fn play_cmd(input: &Path, start: Option<String>) -> Result<()> {
    let pkg = Arc::new(load_package(input)?);
    let start = start.unwrap_or_else(|| format!("{}.main", pkg.name()));
    let entry = StrHash::new(&start);
    if pkg.node(entry).is_none() {
        bail!("entry node '{}' not found in package '{}'", start, pkg.name());
    }

    let mut host = TerminalHost::new(pkg.clone());
    let mut director = Director::new();
    director.spawn(pkg, entry)?;
    while director.has_running() {
        director.tick_frame(&mut host);
    }
    Ok(())
}

/// Blocking terminal front end: lines to stdout, choices from stdin.
struct TerminalHost {
    package: Arc<Package>,
    vars: HashMap<VarKey, Variant>,
}

impl TerminalHost {
    fn new(package: Arc<Package>) -> Self {
        TerminalHost {
            package,
            vars: HashMap::new(),
        }
    }
}

impl EnginePlugin for TerminalHost {
    fn run_line(&mut self, _thread: ThreadHandle, _code: StrHash, text: &str) -> HostFlow {
        println!("{text}");
        HostFlow::Ready
    }

    fn show_options(&mut self, _thread: ThreadHandle, choices: &mut ChoiceBuffer) -> HostFlow {
        let available: Vec<(Variant, StrHash)> = choices
            .available()
            .map(|o| (o.target, o.line))
            .collect();
        for (i, (_, line)) in available.iter().enumerate() {
            let text = self
                .package
                .line(*line)
                .map(|l| l.text.as_str())
                .unwrap_or("???");
            println!("  [{}] {}", i + 1, text);
        }
        let stdin = io::stdin();
        loop {
            print!("> ");
            let _ = io::stdout().flush();
            let mut buf = String::new();
            if stdin.lock().read_line(&mut buf).unwrap_or(0) == 0 {
                // EOF: take the first option and keep the story moving.
                if let Some((target, _)) = available.first() {
                    let _ = choices.choose(*target, None);
                }
                return HostFlow::Ready;
            }
            if let Ok(n) = buf.trim().parse::<usize>() {
                if n >= 1 && n <= available.len() {
                    let (target, _) = available[n - 1];
                    if choices.choose(target, None).is_ok() {
                        return HostFlow::Ready;
                    }
                }
            }
            println!("pick 1..{}", available.len());
        }
    }

    fn get_var(&mut self, key: VarKey, _thread: ThreadHandle) -> Variant {
        self.vars.get(&key).copied().unwrap_or(Variant::Null)
    }

    fn set_var(&mut self, key: VarKey, value: Variant, _thread: ThreadHandle) {
        self.vars.insert(key, value);
    }
}
