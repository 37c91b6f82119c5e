use std::{fmt::Write as _, process, ptr::NonNull};

use argh::FromArgs;
use chunk_alloc::{ChunkAllocator, ChunkView, HEADER_SIZE, SystemPages, locate_error};
use snafu::{OptionExt as _, ResultExt as _};
use snafu_utils::{GenericError, Report};

/// Allocate blocks with the chunk allocator and dump its chunk lists.
#[derive(Debug, FromArgs)]
struct Args {
    /// sizes of the blocks to allocate, in bytes
    #[argh(positional)]
    sizes: Vec<usize>,
    /// index of a block to release (may be repeated)
    #[argh(option)]
    free: Vec<usize>,
    /// index of a block to resize
    #[argh(option)]
    grow: Option<usize>,
    /// new size of the block given by `--grow`
    #[argh(option)]
    to: Option<usize>,
    /// dump chunk headers as dot-separated quadwords
    #[argh(switch)]
    hex: bool,
}

fn main() {
    env_logger::init();
    let args: Args = argh::from_env();

    if let Err(err) = run(&args) {
        let report = Report::with_locator(err, locate_error);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), GenericError> {
    let mut alloc = ChunkAllocator::new(SystemPages);

    let mut blocks = Vec::with_capacity(args.sizes.len());
    for &size in &args.sizes {
        let ptr = alloc
            .allocate(size)
            .with_whatever_context(|_| format!("failed to allocate {size} bytes"))?;
        blocks.push(ptr);
    }
    dump(args, "after allocation", &alloc);

    if !args.free.is_empty() {
        for &index in &args.free {
            let ptr = block(&mut blocks, index)?.take();
            log::debug!("releasing block {index}");
            alloc
                .release(ptr)
                .with_whatever_context(|_| format!("failed to release block {index}"))?;
        }
        dump(args, "after release", &alloc);
    }

    if let Some(index) = args.grow {
        let new_size = args
            .to
            .whatever_context("`--grow` requires `--to <size>`")?;
        let slot = block(&mut blocks, index)?;
        *slot = alloc
            .resize(*slot, new_size)
            .with_whatever_context(|_| {
                format!("failed to resize block {index} to {new_size} bytes")
            })?;
        dump(args, "after resize", &alloc);
    }

    Ok(())
}

fn block(
    blocks: &mut [Option<NonNull<u8>>],
    index: usize,
) -> Result<&mut Option<NonNull<u8>>, GenericError> {
    let len = blocks.len();
    blocks
        .get_mut(index)
        .with_whatever_context(|| format!("no block at index {index}, {len} allocated"))
}

fn dump(args: &Args, phase: &str, alloc: &ChunkAllocator<SystemPages>) {
    println!("== {phase}");
    print_list(args, "free", alloc.free_chunks());
    print_list(args, "allocated", alloc.allocated_chunks());
}

fn print_list<'a, I>(args: &Args, name: &str, chunks: I)
where
    I: ExactSizeIterator<Item = ChunkView<'a>>,
{
    println!("{name} ({} chunks)", chunks.len());
    for chunk in chunks {
        println!(
            "  {:#014x}..{:#014x} size={:<8} user={:<8}",
            chunk.addr(),
            chunk.end(),
            chunk.total_size(),
            chunk.user_size()
        );
        if args.hex {
            println!("    {}", header_quadwords(chunk));
        }
    }
}

fn header_quadwords(chunk: ChunkView<'_>) -> String {
    let header = unsafe { chunk.user_ptr().sub(HEADER_SIZE) };
    let mut out = String::new();
    for i in 0..HEADER_SIZE / size_of::<u64>() {
        let word = unsafe { header.cast::<u64>().add(i).read_unaligned() };
        if i > 0 {
            out.push('.');
        }
        let _ = write!(out, "{word:016x}");
    }
    out
}
