// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

const DEFAULT_RUNDIR: &str = "/run";
const DEFAULT_TUNABLES_PATH: &str = "/etc/primus.toml";

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config_path: String,
    pub rundir: String,
    pub control_path: Option<String>,
    pub tunables_path: String,
    pub runlevel: Option<u8>,
}

fn usage() -> ! {
    eprintln!(
        "usage: primus [--rundir DIR] [--control-path PATH] \
         [--tunables PATH] [--runlevel N] <config_file>"
    );
    std::process::exit(1);
}

fn value(args: &mut impl Iterator<Item = String>, opt: &str) -> String {
    args.next().unwrap_or_else(|| {
        eprintln!("{} requires a value", opt);
        usage();
    })
}

pub fn parse() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    let mut rundir = None;
    let mut control_path = None;
    let mut tunables_path = None;
    let mut runlevel = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--rundir" => rundir = Some(value(&mut args, "--rundir")),
            "--control-path" => {
                control_path = Some(value(&mut args, "--control-path"));
            }
            "--tunables" => {
                tunables_path = Some(value(&mut args, "--tunables"));
            }
            "--runlevel" => {
                let raw = value(&mut args, "--runlevel");
                match raw.parse::<u8>() {
                    Ok(level) if (1..=9).contains(&level) => {
                        runlevel = Some(level);
                    }
                    _ => {
                        eprintln!("bad runlevel: {}", raw);
                        usage();
                    }
                }
            }
            "--help" => usage(),
            other if other.starts_with("-") => {
                eprintln!("unknown option: {}", other);
                usage();
            }
            other => {
                if config_path.is_some() {
                    eprintln!("unexpected argument: {}", other);
                    usage();
                }
                config_path = Some(other.to_string());
            }
        }
    }
    CliArgs {
        config_path: config_path.unwrap_or_else(|| usage()),
        rundir: rundir.unwrap_or_else(|| DEFAULT_RUNDIR.to_owned()),
        control_path,
        tunables_path: tunables_path
            .unwrap_or_else(|| DEFAULT_TUNABLES_PATH.to_owned()),
        runlevel,
    }
}
