//! AEGIS supervisor
//!
//! The root task of the runtime: brings up the kernel interface,
//! constructs the child manager and loads the configured modules as
//! sandboxed children. Runs until every child has been reclaimed.
//!
//! Invocation: `aegis-system [--cpus N] [--verbose] [module...]`
//! where each module is `path[:cmdline]`. Without modules a built-in
//! demo child exercises the load/teardown path.

use std::process::ExitCode;

use aegis_cap::Perm;
use aegis_rt::child::{ChildConfig, ChildManager, build_image};
use aegis_sys::invoke;

mod logger;

struct BootConfig {
    cpus: usize,
    verbose: bool,
    /// (image path, command line) pairs.
    modules: Vec<(String, String)>,
}

fn parse_args() -> Result<BootConfig, String> {
    let mut config = BootConfig { cpus: 2, verbose: false, modules: Vec::new() };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--cpus" => {
                let v = args.next().ok_or("--cpus needs a value")?;
                config.cpus = v.parse().map_err(|_| format!("bad cpu count '{v}'"))?;
            }
            "--verbose" => config.verbose = true,
            other if other.starts_with("--") => {
                return Err(format!("unknown option '{other}'"));
            }
            module => {
                let (path, cmdline) = match module.split_once(':') {
                    Some((p, c)) => (p.to_string(), c.to_string()),
                    None => (module.to_string(), module.to_string()),
                };
                config.modules.push((path, cmdline));
            }
        }
    }
    Ok(config)
}

/// A synthetic child image used when no modules are configured.
fn demo_image() -> Vec<u8> {
    let text = [0x90u8; 128];
    build_image(0x40_0000, &[(0x40_0000, &text, 4096, Perm::R | Perm::X)])
}

fn run(config: &BootConfig) -> Result<(), aegis_cap::Error> {
    let cm = ChildManager::new()?;

    if config.modules.is_empty() {
        log::info!("no modules configured, loading demo child");
        let id = cm.load(&demo_image(), ChildConfig::new(0, "demo"))?;
        log::info!("{} child(ren) running", cm.count());
        cm.kill(id);
        cm.dead_sm().down()?;
        log::info!("demo child reclaimed");
        return Ok(());
    }

    for (path, cmdline) in &config.modules {
        let image = std::fs::read(path).map_err(|e| {
            log::error!("cannot read module '{path}': {e}");
            aegis_cap::Error::NotFound
        })?;
        let id = cm.load(&image, ChildConfig::new(0, cmdline))?;
        log::info!("loaded '{path}' as child {id}");
    }

    while cm.count() > 0 {
        cm.dead_sm().down()?;
    }
    log::info!("all children exited");
    Ok(())
}

fn main() -> ExitCode {
    let config = match parse_args() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("aegis-system: {e}");
            eprintln!("usage: aegis-system [--cpus N] [--verbose] [module[:cmdline]...]");
            return ExitCode::FAILURE;
        }
    };
    logger::init(if config.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });

    invoke::boot(config.cpus);
    log::info!("supervisor starting on {} cpu(s)", aegis_sys::cpu::count());

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("supervisor failed: {e}");
            ExitCode::FAILURE
        }
    }
}
