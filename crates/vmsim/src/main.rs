mod console;

use clap::{Parser, Subcommand};
use std::error::Error;
use std::sync::Arc;

use vmm::{
    AddressSpace, EmulatedFrameAllocator, FaultInfo, FaultOutcome, File, MemFile, PAGE_SIZE,
    PageTarget, RamSwap, SoftwareMmu, SwapDevice, VirtualAddress, Vm, VmConfig,
};

use console::Console;

/// Where the simulated workloads place their pages.
const USER_BASE: usize = 0x1000_0000;

#[derive(Parser)]
#[command(name = "vmsim")]
#[command(about = "Demand-paging simulator for the Polaris virtual memory manager")]
struct Args {
    /// Number of physical frames available to user pages
    #[arg(short, long, default_value_t = 16)]
    frames: usize,

    /// Number of page-sized swap slots (0 disables swap)
    #[arg(short, long, default_value_t = 64)]
    swap_slots: usize,

    /// Increase log verbosity (repeat for more detail)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Cycle through a working set larger than memory, checking every page each round
    Anon {
        /// Pages in the working set
        #[arg(short, long, default_value_t = 48)]
        pages: usize,

        /// Number of passes over the working set
        #[arg(short, long, default_value_t = 3)]
        rounds: usize,
    },
    /// Map a file, dirty every other page, unmap it and check what reached the file
    Mmap {
        /// Pages in the mapping
        #[arg(short, long, default_value_t = 10)]
        pages: usize,
    },
    /// Copy an address space and check that the copy is independent
    Fork {
        /// Pages in the parent address space
        #[arg(short, long, default_value_t = 8)]
        pages: usize,
    },
}

fn page_va(index: usize) -> VirtualAddress {
    VirtualAddress::new(USER_BASE + index * PAGE_SIZE)
}

/// An eight-byte stamp identifying a page and the pass that wrote it.
fn signature(page: usize, round: usize) -> [u8; 8] {
    (((page as u64) << 32) | round as u64).to_le_bytes()
}

fn check_signature(
    space: &AddressSpace,
    page: usize,
    expected: [u8; 8],
) -> Result<(), Box<dyn Error>> {
    let mut found = [0u8; 8];
    space.read_user(page_va(page), &mut found)?;
    if found != expected {
        return Err(format!("page {page}: expected {expected:02x?}, found {found:02x?}").into());
    }
    Ok(())
}

fn anon(space: &AddressSpace, pages: usize, rounds: usize) -> Result<(), Box<dyn Error>> {
    for page in 0..pages {
        space.alloc_page(PageTarget::Anon, page_va(page), true)?;
    }

    for round in 0..rounds {
        for page in 0..pages {
            if round == 0 {
                // Deliver the first touch the way the trap path would.
                let info = FaultInfo::new(page_va(page), true, true, true);
                if let FaultOutcome::KillProcess(err) = space.fault(info) {
                    return Err(format!("page {page}: fault not resolved: {err}").into());
                }
            } else {
                check_signature(space, page, signature(page, round - 1))?;
            }
            space.write_user(page_va(page), &signature(page, round))?;
        }
        log::info!("round {round}: {pages} pages verified");
    }
    println!("anon: {pages} pages survived {rounds} rounds");
    Ok(())
}

fn mmap(space: &AddressSpace, pages: usize) -> Result<(), Box<dyn Error>> {
    if pages == 0 {
        return Err("a mapping needs at least one page".into());
    }
    // The file ends halfway through the last page.
    let len = pages * PAGE_SIZE - PAGE_SIZE / 2;
    let file = MemFile::new((0..len).map(|i| (i % 251) as u8 + 1).collect::<Vec<_>>());
    let handle: Arc<dyn File> = Arc::new(file.clone());

    let base = space.mmap(page_va(0), pages * PAGE_SIZE, true, &handle, 0)?;
    for page in (0..pages).step_by(2) {
        space.write_user(base + page * PAGE_SIZE, &signature(page, 0))?;
    }
    let mut tail = vec![0u8; PAGE_SIZE / 2];
    space.read_user(base + len, &mut tail)?;
    if tail.iter().any(|&b| b != 0) {
        return Err("bytes beyond the end of the file are not zero".into());
    }
    space.munmap(base)?;

    let contents = file.contents();
    for page in 0..pages {
        let offset = page * PAGE_SIZE;
        let stamped = contents[offset..offset + 8] == signature(page, 0);
        if stamped != (page % 2 == 0) {
            return Err(format!("page {page}: unexpected file contents after unmap").into());
        }
    }
    println!(
        "mmap: {pages} pages mapped, {} written back, file length {}",
        file.write_count(),
        contents.len()
    );
    Ok(())
}

fn fork(space: &AddressSpace, pages: usize) -> Result<(), Box<dyn Error>> {
    for page in 0..pages {
        space.alloc_page(PageTarget::Anon, page_va(page), true)?;
        // Leave the last page untouched so the copy keeps it lazy.
        if page + 1 < pages {
            space.write_user(page_va(page), &signature(page, 0))?;
        }
    }

    let child = space.fork(Arc::new(SoftwareMmu::new()))?;
    for page in 0..pages.saturating_sub(1) {
        child.write_user(page_va(page), &signature(page, 1))?;
    }
    for page in 0..pages.saturating_sub(1) {
        check_signature(space, page, signature(page, 0))?;
        check_signature(&child, page, signature(page, 1))?;
    }
    child.destroy()?;
    println!("fork: {pages} pages copied, parent and child independent");
    Ok(())
}

fn print_stats(vm: &Vm) {
    let stats = vm.stats().snapshot();
    println!("faults:         {}", stats.faults);
    println!("stack growths:  {}", stats.stack_growths);
    println!("claims:         {}", stats.claims);
    println!("evictions:      {}", stats.evictions);
    println!("swap outs:      {}", stats.swap_outs);
    println!("swap ins:       {}", stats.swap_ins);
    println!("write backs:    {}", stats.write_backs);
    println!("file reads:     {}", stats.file_reads);
    println!("failures:       {}", stats.failures);
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    Console::install(args.verbose);

    let swap = (args.swap_slots > 0)
        .then(|| Box::new(RamSwap::new(args.swap_slots)) as Box<dyn SwapDevice>);
    let vm = vmm::install(Vm::new(
        VmConfig::new(),
        Arc::new(EmulatedFrameAllocator::new(args.frames)),
        swap,
    ));

    let space = AddressSpace::new(vm.clone(), Arc::new(SoftwareMmu::new()));
    space.setup_stack()?;
    match args.command {
        Command::Anon { pages, rounds } => anon(&space, pages, rounds)?,
        Command::Mmap { pages } => mmap(&space, pages)?,
        Command::Fork { pages } => fork(&space, pages)?,
    }
    space.destroy()?;

    print_stats(vmm::current());
    Ok(())
}
