use std::collections::VecDeque;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use kiln::{
    common::constants::DEFAULT_HEAP_SIZE, Context, EvalResult, GcType, Global, HandleScope,
    ObjectValue, OptionsBuilder, SpaceType, TaggedValue,
};

/// Raw command line arguments.
#[derive(Parser)]
#[command(about = "Allocation and collection stress driver for the kiln heap")]
pub struct Args {
    /// The heap size, in bytes.
    #[arg(long)]
    pub heap_size: Option<usize>,

    /// Number of allocation rounds
    #[arg(short, long, default_value_t = 100)]
    pub iterations: usize,

    /// Objects allocated per round
    #[arg(long, default_value_t = 10_000)]
    pub objects: usize,

    /// Number of objects kept alive across rounds through global handles
    #[arg(long, default_value_t = 1_000)]
    pub retained: usize,

    /// Collection to request explicitly after every round. By default the heap
    /// only collects when it needs to.
    #[arg(long, value_enum)]
    pub gc_type: Option<GcKind>,

    /// Run with background GC tuning
    #[arg(long, default_value_t = false)]
    pub background: bool,

    /// Disable concurrent marking
    #[arg(long, default_value_t = false)]
    pub no_concurrent_mark: bool,

    /// Disable concurrent sweeping
    #[arg(long, default_value_t = false)]
    pub no_concurrent_sweep: bool,

    /// Number of collector threads, 0 to use the number of CPUs
    #[arg(long, default_value_t = 0)]
    pub gc_threads: usize,

    /// Print GC statistics at exit
    #[arg(long, default_value_t = false)]
    pub gc_stats: bool,

    /// Run a young GC on every young allocation
    #[arg(long, default_value_t = false)]
    pub gc_stress_test: bool,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum GcKind {
    Young,
    Partial,
    Full,
}

impl From<GcKind> for GcType {
    fn from(kind: GcKind) -> GcType {
        match kind {
            GcKind::Young => GcType::Young,
            GcKind::Partial => GcType::Partial,
            GcKind::Full => GcType::Full,
        }
    }
}

pub fn print_error_message_and_exit(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn create_context(args: &Args) -> Context {
    let options = OptionsBuilder::new()
        .heap_size(args.heap_size.unwrap_or(DEFAULT_HEAP_SIZE))
        .gc_thread_num(args.gc_threads)
        .concurrent_mark(!args.no_concurrent_mark)
        .concurrent_sweep(!args.no_concurrent_sweep)
        .expose_gc_stats(args.gc_stats)
        .gc_stress_test(args.gc_stress_test)
        .build();

    let mut cx = Context::new(options);
    if args.background {
        cx.change_gc_params(true);
    }

    cx
}

/// Run a round in its own handle scope, escaping the error object on failure.
fn run_round(
    cx: &mut Context,
    args: &Args,
    round: usize,
    retained: &mut VecDeque<Global<ObjectValue>>,
) -> EvalResult<()> {
    let mut scope = HandleScope::new(cx);
    match allocate_round(&mut scope, args, round, retained) {
        Ok(()) => Ok(()),
        Err(error) => Err(scope.escape(error)),
    }
}

/// One round: a burst of short lived objects, some of which replace the oldest
/// retained objects.
fn allocate_round(
    cx: &mut Context,
    args: &Args,
    round: usize,
    retained: &mut VecDeque<Global<ObjectValue>>,
) -> EvalResult<()> {
    let retain_every = (args.objects / args.retained.max(1)).max(1);

    let mut previous: Option<kiln::Handle<ObjectValue>> = None;
    for i in 0..args.objects {
        let object = cx.alloc_object(2, SpaceType::Young)?;
        cx.set_field(object, 0, TaggedValue::from_i32((round * args.objects + i) as i32));

        // Chain objects so survivors drag a tail along with them
        if let Some(previous) = previous {
            let value = previous.value(cx);
            cx.set_field(object, 1, value);
        }
        previous = Some(object);

        if i % retain_every == 0 && args.retained > 0 {
            retained.push_back(Global::new(cx, object));
            if retained.len() > args.retained {
                if let Some(oldest) = retained.pop_front() {
                    oldest.dispose(cx);
                }
            }
        }

        if i % 64 == 0 {
            cx.alloc_string(&format!("round {round} object {i}"))?;
        }
    }

    if let Some(gc_type) = args.gc_type {
        cx.collect_garbage(gc_type.into())?;
    }

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let mut cx = create_context(&args);
    let mut retained = VecDeque::new();

    for round in 0..args.iterations {
        if let Err(error) = run_round(&mut cx, &args, round, &mut retained) {
            let message = error.get(&cx).to_display_string(&cx);
            print_error_message_and_exit(&message);
        }
    }

    let stats = cx.gc_stats();
    info!(
        young = stats.young_gc_count,
        partial = stats.partial_gc_count,
        full = stats.full_gc_count,
        "stress run finished"
    );

    #[cfg(feature = "handle_stats")]
    println!("{:?}", cx.handle_stats());

    for global in retained {
        global.dispose(&cx);
    }
}
