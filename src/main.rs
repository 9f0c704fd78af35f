// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: 2023 Netflix, Inc., jkoch@netflix.com.
#[macro_use]
extern crate scan_fmt;

#[macro_use]
mod verbose;

mod byte_helpers;
mod coredump;
mod dumpfilter;
mod fields;
mod kernel;
mod layout;
mod linux;
mod regset;
mod regset_x86_64;
mod snapshot;
mod task;
mod vma;
mod write_elf;

use crate::coredump::{coredump, DumpConfig};
use crate::kernel::{Kernel, KernelParams};
use crate::layout::{parse_number, Layout, TypeInfo};
use crate::regset::Machine;
use crate::snapshot::{DirectMap, KernelMemory, PhysicalImage, VirtualTranslate, X64PageWalk};
use anyhow::{anyhow, Context};
use clap::Parser;
use log::{debug, info};
use std::io;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Raw physical memory image of the inspected machine
    #[arg(short, long)]
    image: PathBuf,

    /// Structure layout file of the inspected kernel
    #[arg(short, long)]
    layout: PathBuf,

    /// Kernel address of the task_struct to dump
    #[arg(short, long, value_parser = parse_number)]
    task: u64,

    /// Physical address of the kernel page table root; without it kernel
    /// addresses go through the direct map
    #[arg(long, value_parser = parse_number)]
    dtb: Option<u64>,

    /// Dump filter mask, as in /proc/<pid>/coredump_filter
    #[arg(short, long, value_parser = parse_number)]
    filter: Option<u64>,

    /// Verbose level: 1 progress, 2 every read failure, 4 page faults
    #[arg(short, long, value_parser = parse_number)]
    verbose: Option<u64>,

    /// Regset view to use instead of the machine default
    #[arg(long)]
    view: Option<String>,
}

fn main() -> Result<(), anyhow::Error> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .env()
        .init()
        .context("could not initialize logging")?;

    let args = Args::parse();
    let output = &mut io::stdout().lock();

    let config = DumpConfig::default();
    if let Some(mask) = args.filter {
        config.filter.set(mask).context("invalid dump filter")?;
    }
    if let Some(level) = args.verbose {
        config.verbosity.set(level).context("invalid verbose level")?;
    }

    debug!("loading layout...");
    let layout = Layout::read_file(&args.layout)
        .with_context(|| format!("could not read layout {}", args.layout.display()))?;
    let machine: Machine = layout
        .arch()
        .ok_or_else(|| anyhow!("layout does not name an architecture"))?
        .parse()
        .context("unsupported layout architecture")?;

    if let Some(name) = &args.view {
        let view = regset::find_view(name).context("unknown regset view")?;
        regset::register_view_override(view).context("could not override regset view")?;
    }
    let view = regset::select_view(machine).context("no regset view for the machine")?;

    let fields = fields::install(fields::FieldTable::populate(&layout))
        .context("could not install field table")?;
    info!(
        "resolved {} of {} fields for {}",
        fields.count_present(),
        fields::Field::ALL.len(),
        machine
    );
    let params = KernelParams::from_type_info(&layout);

    let image = PhysicalImage::open(&args.image)
        .with_context(|| format!("could not open image {}", args.image.display()))?;
    let translate: Box<dyn VirtualTranslate> = match args.dtb {
        Some(root) => Box::new(X64PageWalk::new(root)),
        None => Box::new(DirectMap::new(params.page_offset)),
    };
    let kernel = Kernel::new(KernelMemory::new(&image, translate), fields, params);

    info!("dumping core for task {:#x} ...", args.task);
    let summary = coredump(&kernel, view, &config, args.task, output)
        .with_context(|| format!("could not dump task {:#x}", args.task))?;

    info!(
        "dump complete: {} threads, {} notes, {} segments, {} bytes, {} unreadable pages",
        summary.threads, summary.notes, summary.segments, summary.bytes, summary.faulted_pages
    );

    Ok(())
}
