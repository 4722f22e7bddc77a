use std::sync::atomic::{AtomicUsize, Ordering};
use unihook::{HookContext, Interceptor, Target, Variant};

static CALL_COUNT: AtomicUsize = AtomicUsize::new(0);

#[repr(C)]
struct Calculator {
    add: extern "C" fn(i64, i64) -> i64,
}

extern "C" fn original_add(a: i64, b: i64) -> i64 {
    a + b
}

extern "C" fn log_entry(a: i64, b: i64) -> i64 {
    CALL_COUNT.fetch_add(1, Ordering::Relaxed);
    println!("[entry] add({}, {})", a, b);
    0
}

extern "C" fn log_exit(a: i64, b: i64) -> i64 {
    println!("[exit] add({}, {}) returned", a, b);
    0
}

unsafe extern "C" fn double_second(ctx: &mut HookContext) {
    let b = ctx.arg(1).unwrap_or(0);
    println!("[context] doubling b = {}", b as i64);
    ctx.set_arg(1, b.wrapping_mul(2));
}

fn main() {
    println!("=== Entry / Exit / Context Hook Example ===\n");

    let mut calc = Calculator { add: original_add };
    let slot = Target::slot(&mut calc.add as *mut _ as usize);
    let interceptor = Interceptor::new();

    println!("Before hooking: 2 + 3 = {}", (calc.add)(2, 3));

    let handles = unsafe {
        [
            interceptor.install(slot, log_entry as usize, Variant::ENTRY),
            interceptor.chain(slot, log_exit as usize, Variant::EXIT),
            interceptor.chain(slot, double_second as usize, Variant::CONTEXT),
        ]
    };

    let handles: Vec<_> = match handles.into_iter().collect::<Result<_, _>>() {
        Ok(handles) => handles,
        Err(e) => {
            eprintln!("Hooking failed: {}", e);
            return;
        }
    };

    let add = unsafe { std::ptr::read_volatile(&calc.add) };
    println!("After hooking: 2 + 3 = {}", add(2, 3));
    println!("Chain length: {}", interceptor.chain_len(slot));

    // Splice the exit hook out of the middle of the chain.
    if let Err(e) = unsafe { interceptor.uninstall(handles[1]) } {
        eprintln!("Uninstall failed: {}", e);
    }
    println!("Without exit hook: 2 + 3 = {}", add(2, 3));

    drop(interceptor);
    let add = unsafe { std::ptr::read_volatile(&calc.add) };
    println!("After dropping the interceptor: 2 + 3 = {}", add(2, 3));
    println!("Entry handler ran {} times", CALL_COUNT.load(Ordering::Relaxed));
}
