/*
 * BSD 2-Clause License
 *
 * Copyright (c) 2021, Khaled Emara
 * All rights reserved.
 *
 * Redistribution and use in source and binary forms, with or without
 * modification, are permitted provided that the following conditions are met:
 *
 * 1. Redistributions of source code must retain the above copyright notice, this
 *    list of conditions and the following disclaimer.
 *
 * 2. Redistributions in binary form must reproduce the above copyright notice,
 *    this list of conditions and the following disclaimer in the documentation
 *    and/or other materials provided with the distribution.
 *
 * THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
 * AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
 * IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
 * DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
 * FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
 * DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
 * SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
 * CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
 * OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
 * OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
 */
#![allow(dead_code)]
mod libzfuse;

use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use fuser::MountOption;
use tracing_subscriber::EnvFilter;

use libzfuse::{dataset::Dataset, pool::Pool, volume::Volume};

#[derive(Parser)]
#[command(name = "zfs-fuse", version, about = "Read-only FUSE server implementing ZFS")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount one dataset of a pool, read-only
    Mount {
        /// Directory to mount on
        mountpoint: PathBuf,

        /// Dataset path, e.g. "rpool/ROOT/opensolaris"
        dataset: String,

        /// Pool members: block devices or disk-image files
        #[arg(required = true)]
        devices: Vec<PathBuf>,

        /// Extra mount options
        #[arg(short, long)]
        option: Vec<String>,
    },

    /// Print the datasets of a pool and their mountpoints
    List {
        /// Pool members: block devices or disk-image files
        #[arg(required = true)]
        devices: Vec<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("zfs-fuse: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Mount {
            mountpoint,
            dataset,
            devices,
            option,
        } => {
            let pool = Pool::open(&devices)?;
            let volume = Volume::mount(pool, &dataset)?;

            let mut options = vec![
                MountOption::RO,
                MountOption::FSName("zfs".to_owned()),
                MountOption::Subtype("zfs-fuse".to_owned()),
            ];
            options.extend(option.into_iter().map(MountOption::CUSTOM));

            fuser::mount2(volume, &mountpoint, &options)?;
            Ok(())
        }
        Command::List { devices } => {
            let pool = Pool::open(&devices)?;
            let name = pool.name.clone();
            let rootbp = pool.active().rootbp;
            let root = Dataset::open(&pool, &rootbp, &name)?;

            println!("{:<40} MOUNTPOINT", "NAME");
            print_tree(&root, &name);
            Ok(())
        }
    }
}

fn print_tree(dataset: &Dataset, path: &str) {
    println!("{:<40} {}", path, dataset.mountpoint().unwrap_or("-"));
    for child in dataset.children() {
        print_tree(child, &format!("{path}/{}", child.name()));
    }
}
