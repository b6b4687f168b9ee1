// Copyright (C) 2025 Paul Hampson
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License version 3 as  published by the
// Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program.  If not, see <https://www.gnu.org/licenses/>.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

const BOOTLOADER_PACKAGE: &str = "fota-bootloader";
const BOOTLOADER_DIR: &str = "fota-bootloader";
const LOADER_CLI_PACKAGE: &str = "fota-loader-cli";
const EMBEDDED_TARGET: &str = "thumbv6m-none-eabi";

/// Crates with host side tests
const TESTED_PACKAGES: [&str; 3] = ["fota-core", "fota-host-core", "fota-loader-cli"];

#[derive(Debug)]
enum BuildTarget {
    Bootloader,
    LoaderCli,
    All,
}

#[derive(Debug)]
enum Command_ {
    Build(BuildTarget),
    Flash,
    Run(BuildTarget, Vec<String>),
    Attach,
    Test,
    Help,
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let command = match parse_command(&args[1..]) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error parsing command: {}", e);
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = execute_command(command) {
        eprintln!("Error executing command: {}", e);
        std::process::exit(1);
    }
}

fn parse_command(args: &[String]) -> Result<Command_, String> {
    let Some(command) = args.first() else {
        return Err("No command provided".to_string());
    };

    match command.as_str() {
        "build" => {
            let target = match args.get(1) {
                Some(target) => parse_build_target(target)?,
                None => BuildTarget::All,
            };
            Ok(Command_::Build(target))
        }
        "flash" => Ok(Command_::Flash),
        "run" => {
            let target = match args.get(1) {
                Some(target) => parse_build_target(target)?,
                None => return Err("run command requires a target (bootloader or fota-loader-cli)".to_string()),
            };
            if let BuildTarget::All = target {
                return Err("run command only supports bootloader or fota-loader-cli, not all".to_string());
            }
            Ok(Command_::Run(target, args[2..].to_vec()))
        }
        "attach" => Ok(Command_::Attach),
        "test" => Ok(Command_::Test),
        "help" => Ok(Command_::Help),
        _ => Err(format!("Unknown command: {}", command)),
    }
}

fn parse_build_target(target: &str) -> Result<BuildTarget, String> {
    match target {
        "bootloader" => Ok(BuildTarget::Bootloader),
        "fota-loader-cli" => Ok(BuildTarget::LoaderCli),
        "all" => Ok(BuildTarget::All),
        _ => Err(format!("Unknown target: {}", target)),
    }
}

fn execute_command(cmd: Command_) -> Result<(), String> {
    match cmd {
        Command_::Build(target) => build(&target),
        Command_::Flash => {
            println!("Building and flashing bootloader...");
            run_cargo_flash()?;
            println!("✓ Bootloader flashed successfully");
            Ok(())
        }
        Command_::Run(target, extra_args) => run(&target, &extra_args),
        Command_::Attach => {
            println!("Attaching to bootloader...");
            run_probe_rs_attach()?;
            println!("✓ Bootloader attach completed");
            Ok(())
        }
        Command_::Test => {
            println!("Running host tests...");
            run_cargo_test()?;
            println!("✓ Tests passed");
            Ok(())
        }
        Command_::Help => {
            print_usage();
            Ok(())
        }
    }
}

fn build(target: &BuildTarget) -> Result<(), String> {
    if let BuildTarget::Bootloader | BuildTarget::All = target {
        println!("Building bootloader...");
        run_cargo(bootloader_cargo("build"))?;
        generate_bin()?;
        println!("✓ Bootloader built successfully");
    }
    if let BuildTarget::LoaderCli | BuildTarget::All = target {
        println!("Building {}...", LOADER_CLI_PACKAGE);
        run_cargo(host_cargo("build", LOADER_CLI_PACKAGE, &[]))?;
        println!("✓ {} built successfully", LOADER_CLI_PACKAGE);
    }
    Ok(())
}

fn run(target: &BuildTarget, extra_args: &[String]) -> Result<(), String> {
    match target {
        BuildTarget::Bootloader => {
            println!("Building and running bootloader...");
            run_cargo(bootloader_cargo("run"))?;
            println!("✓ Bootloader run completed");
        }
        BuildTarget::LoaderCli => {
            println!("Building and running {}...", LOADER_CLI_PACKAGE);
            if extra_args.is_empty() {
                println!("Usage: cargo xtask run fota-loader-cli [--port <PORT>] [--node-id <ID>] <FIRMWARE.bin>");
                return Err("no firmware file given".to_string());
            }
            run_cargo(host_cargo("run", LOADER_CLI_PACKAGE, extra_args))?;
            println!("✓ {} run completed", LOADER_CLI_PACKAGE);
        }
        BuildTarget::All => {
            unreachable!("All target should have been rejected in parse_command")
        }
    }
    Ok(())
}

/// The bootloader is outside the workspace and picks up its target and runner from its own
/// cargo config, so cargo runs from its directory.
fn bootloader_cargo(subcommand: &str) -> Command {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(BOOTLOADER_DIR)
        .args([subcommand, "--release", "--target", EMBEDDED_TARGET]);
    cmd
}

fn host_cargo(subcommand: &str, package: &str, extra_args: &[String]) -> Command {
    let mut cmd = Command::new("cargo");
    cmd.args([subcommand, "--release", "--package", package]);
    if !extra_args.is_empty() {
        cmd.arg("--").args(extra_args);
    }
    cmd
}

fn run_cargo(mut cmd: Command) -> Result<(), String> {
    let status = cmd
        .status()
        .map_err(|e| format!("Failed to run {:?}: {}", cmd, e))?;

    if !status.success() {
        return Err(format!("{:?} failed", cmd));
    }
    Ok(())
}

fn run_cargo_test() -> Result<(), String> {
    let mut cmd = Command::new("cargo");
    cmd.arg("test");
    for package in TESTED_PACKAGES {
        cmd.args(["--package", package]);
    }
    run_cargo(cmd)
}

fn run_cargo_flash() -> Result<(), String> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(BOOTLOADER_DIR).args([
        "flash",
        "--release",
        "--target",
        EMBEDDED_TARGET,
        "--chip",
        "RP2040",
    ]);
    run_cargo(cmd)
}

fn bootloader_elf() -> PathBuf {
    Path::new(BOOTLOADER_DIR)
        .join("target")
        .join(EMBEDDED_TARGET)
        .join("release")
        .join(BOOTLOADER_PACKAGE)
}

fn generate_bin() -> Result<(), String> {
    let elf_path = bootloader_elf();
    let bin_path = elf_path.with_extension("bin");

    if !elf_path.exists() {
        return Err(format!("ELF binary not found at {}", elf_path.display()));
    }

    println!("Generating .bin file for {}...", BOOTLOADER_PACKAGE);

    let output = Command::new("arm-none-eabi-objcopy")
        .arg("-O")
        .arg("binary")
        .arg(&elf_path)
        .arg(&bin_path)
        .output()
        .map_err(|e| {
            format!(
                "Failed to run arm-none-eabi-objcopy: {}. Make sure arm-none-eabi-objcopy is installed.",
                e
            )
        })?;

    if !output.status.success() {
        return Err(format!(
            "Failed to generate .bin file for {}:\n{}",
            BOOTLOADER_PACKAGE,
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    println!("✓ Generated {}", bin_path.display());
    Ok(())
}

fn run_probe_rs_attach() -> Result<(), String> {
    let elf_path = bootloader_elf();

    if !elf_path.exists() {
        return Err(format!(
            "ELF binary not found at {}. Build the project first using 'cargo xtask build bootloader'.",
            elf_path.display()
        ));
    }

    let mut cmd = Command::new("probe-rs");
    cmd.args(["attach", "--chip", "RP2040"]).arg(&elf_path);
    run_cargo(cmd)
}

fn print_usage() {
    eprintln!(
        "Usage: cargo xtask <COMMAND> [TARGET]\n\
         \n\
         Commands:\n\
         \tbuild       Build the specified target or all (generates the bootloader .bin)\n\
         \tflash       Build and flash the bootloader\n\
         \trun         Build and run the specified target (bootloader or fota-loader-cli)\n\
         \tattach      Attach to the bootloader with probe-rs\n\
         \ttest        Run the host side tests\n\
         \thelp        Show this help message\n\
         \n\
         Targets:\n\
         \tbootloader          The RP2040 bootloader\n\
         \tfota-loader-cli     The host firmware loader\n\
         \tall                 Both (default for build)\n\
         \n\
         Examples:\n\
         \tcargo xtask build                                          # Build everything\n\
         \tcargo xtask build bootloader                               # Build bootloader with .bin generation\n\
         \tcargo xtask flash                                          # Flash the bootloader\n\
         \tcargo xtask run bootloader                                 # Run bootloader with probe-rs\n\
         \tcargo xtask run fota-loader-cli --port /dev/ttyACM0 app.bin  # Send app.bin to a node\n\
         \tcargo xtask run fota-loader-cli --log-level DEBUG app.bin   # Run with DEBUG log level\n\
         \tcargo xtask test                                           # Run host tests\n\
         \tcargo xtask attach                                         # Attach to bootloader with probe-rs"
    );
}
