//! End-to-end dispatch through the Cranelift backend
//!
//! Targets are C library functions found through the program's own symbol
//! table, plus `extern "C"` Rust functions registered explicitly.

use outcall::{
    CacheEntry, CallSite, CallSiteId, CraneliftBackend, DispatchConfig, ExternalDispatcher,
    ExternalFunction, HostSymbols, LoadError, OptLevel, UnbuildablePolicy, ValType,
};
use parking_lot::{Mutex, MutexGuard};

/// The argument channel is process-wide; dispatch one test at a time.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock()
}

// ============================================================================
// Native targets
// ============================================================================

extern "C" fn add(a: i32, b: i32) -> i32 {
    a + b
}

extern "C" fn sum3(a: i64, b: i64, c: i64) -> i64 {
    a + b + c
}

extern "C" fn scale(k: i32, x: f64) -> f64 {
    k as f64 * x
}

extern "C" fn counter_bump(counter: *mut u32) {
    unsafe { *counter += 1 };
}

fn dispatcher() -> ExternalDispatcher<'static, CraneliftBackend> {
    let mut symbols = HostSymbols::new();
    symbols.add_symbol("add", add as usize);
    symbols.add_symbol("sum3", sum3 as usize);
    symbols.add_symbol("scale", scale as usize);
    symbols.add_symbol("counter_bump", counter_bump as usize);

    let backend = CraneliftBackend::with_symbols(symbols, OptLevel::Speed).unwrap();
    ExternalDispatcher::with_backend(backend, DispatchConfig::default().with_prebind_crt(false))
}

fn i32_word(value: i32) -> u64 {
    value as u32 as u64
}

// ============================================================================
// Results and arguments
// ============================================================================

#[test]
fn test_add_three_and_four() {
    let _serial = serial();
    let mut dispatcher = dispatcher();
    let target = ExternalFunction::new("add", vec![ValType::I32, ValType::I32], Some(ValType::I32));
    let site = CallSite::new(CallSiteId(1), vec![ValType::I32, ValType::I32], Some(ValType::I32));

    let mut args = [0u64, i32_word(3), i32_word(4)];
    assert!(dispatcher.execute_call(&target, &site, &mut args).unwrap());
    assert_eq!(args[0], 7);
}

#[test]
fn test_libc_abs() {
    let _serial = serial();
    let mut dispatcher = dispatcher();
    let target = ExternalFunction::new("abs", vec![ValType::I32], Some(ValType::I32));
    let site = CallSite::new(CallSiteId(2), vec![ValType::I32], Some(ValType::I32));

    let mut args = [0u64, i32_word(-42)];
    assert!(dispatcher.execute_call(&target, &site, &mut args).unwrap());
    assert_eq!(args[0] as u32 as i32, 42);
}

#[test]
fn test_libc_strlen_with_pointer_argument() {
    let _serial = serial();
    let mut dispatcher = dispatcher();
    let text = std::ffi::CString::new("outcall").unwrap();
    let target = ExternalFunction::new("strlen", vec![ValType::Ptr], Some(ValType::I64));
    let site = CallSite::new(CallSiteId(3), vec![ValType::Ptr], Some(ValType::I64));

    let mut args = [0u64, text.as_ptr() as u64];
    assert!(dispatcher.execute_call(&target, &site, &mut args).unwrap());
    assert_eq!(args[0], 7);
}

#[test]
fn test_void_target_with_side_effect() {
    let _serial = serial();
    let mut dispatcher = dispatcher();
    let mut counter = 0u32;
    let target = ExternalFunction::new("counter_bump", vec![ValType::Ptr], None);
    let site = CallSite::new(CallSiteId(4), vec![ValType::Ptr], None);

    for _ in 0..3 {
        let mut args = [0xabcdu64, &mut counter as *mut u32 as u64];
        assert!(dispatcher.execute_call(&target, &site, &mut args).unwrap());
        assert_eq!(args[0], 0xabcd);
    }
    assert_eq!(counter, 3);
    assert_eq!(dispatcher.cache().stats().builds, 1);
}

// ============================================================================
// Parameter type selection
// ============================================================================

#[test]
fn test_extra_arguments_through_cast_pointer() {
    let _serial = serial();
    let mut dispatcher = dispatcher();
    // Declared with one parameter, called with three
    let target = ExternalFunction::new("sum3", vec![ValType::I64], Some(ValType::I64));
    let site = CallSite::new(
        CallSiteId(5),
        vec![ValType::I64, ValType::I64, ValType::I64],
        Some(ValType::I64),
    );

    let mut args = [0u64, 1, 2, 3];
    assert!(dispatcher.execute_call(&target, &site, &mut args).unwrap());
    assert_eq!(args[0], 6);
}

#[test]
fn test_extra_float_argument_keeps_apparent_type() {
    let _serial = serial();
    let mut dispatcher = dispatcher();
    // Only `k` is declared; `x` must travel as a double
    let target = ExternalFunction::new("scale", vec![ValType::I32], Some(ValType::F64));
    let site = CallSite::new(CallSiteId(6), vec![ValType::I32, ValType::F64], Some(ValType::F64));

    let mut args = [0u64, i32_word(4), 2.5f64.to_bits()];
    assert!(dispatcher.execute_call(&target, &site, &mut args).unwrap());
    assert_eq!(f64::from_bits(args[0]), 10.0);
}

#[cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]
#[test]
fn test_variadic_double_argument() {
    let _serial = serial();
    let mut dispatcher = dispatcher();
    let target = ExternalFunction::variadic(
        "snprintf",
        vec![ValType::Ptr, ValType::I64, ValType::Ptr],
        Some(ValType::I32),
    );
    let site = CallSite::new(
        CallSiteId(13),
        vec![ValType::Ptr, ValType::I64, ValType::Ptr, ValType::F64],
        Some(ValType::I32),
    );
    let format = std::ffi::CString::new("%.1f").unwrap();

    for _ in 0..3 {
        let mut text = [0u8; 64];
        let mut args = [
            0u64,
            text.as_mut_ptr() as u64,
            text.len() as u64,
            format.as_ptr() as u64,
            2.5f64.to_bits(),
        ];
        assert!(dispatcher.execute_call(&target, &site, &mut args).unwrap());
        assert_eq!(args[0] as u32, 3);
        let written = std::ffi::CStr::from_bytes_until_nul(&text).unwrap();
        assert_eq!(written.to_str().unwrap(), "2.5");
    }
    assert_eq!(dispatcher.cache().stats().builds, 1);
}

// ============================================================================
// Symbol resolution
// ============================================================================

#[test]
fn test_unresolvable_symbol() {
    let _serial = serial();
    let mut dispatcher = dispatcher();
    let target = ExternalFunction::new("no_such_symbol", vec![], Some(ValType::I32));
    let site = CallSite::new(CallSiteId(7), vec![], Some(ValType::I32));

    let mut args = [0u64];
    assert!(!dispatcher.execute_call(&target, &site, &mut args).unwrap());
    assert!(!dispatcher.execute_call(&target, &site, &mut args).unwrap());
    assert!(matches!(dispatcher.cache().get(CallSiteId(7)), Some(CacheEntry::Unbuildable)));
    assert_eq!(dispatcher.backend().trampoline_count(), 0);
}

#[test]
fn test_marked_name() {
    let _serial = serial();
    let mut dispatcher = dispatcher();
    let target = ExternalFunction::new("\u{1}abs", vec![ValType::I32], Some(ValType::I32));
    let site = CallSite::new(CallSiteId(8), vec![ValType::I32], Some(ValType::I32));

    assert_eq!(dispatcher.resolve("\u{1}abs"), dispatcher.resolve("abs"));
    let mut args = [0u64, i32_word(-1)];
    assert!(dispatcher.execute_call(&target, &site, &mut args).unwrap());
    assert_eq!(args[0], 1);
}

#[test]
fn test_retry_policy_picks_up_late_symbol() {
    let _serial = serial();
    let config = DispatchConfig::default()
        .with_prebind_crt(false)
        .with_unbuildable(UnbuildablePolicy::Retry);
    let mut backend = CraneliftBackend::with_symbols(HostSymbols::new(), OptLevel::None).unwrap();
    let mut dispatcher = ExternalDispatcher::attach(&mut backend, config);
    let target = ExternalFunction::new("late_add", vec![ValType::I32, ValType::I32], Some(ValType::I32));
    let site = CallSite::new(CallSiteId(9), vec![ValType::I32, ValType::I32], Some(ValType::I32));

    let mut args = [0u64, i32_word(20), i32_word(22)];
    assert!(!dispatcher.execute_call(&target, &site, &mut args).unwrap());

    dispatcher.backend_mut().symbols_mut().add_symbol("late_add", add as usize);
    assert!(dispatcher.execute_call(&target, &site, &mut args).unwrap());
    assert_eq!(args[0], 42);
    drop(dispatcher);

    assert_eq!(backend.trampoline_count(), 1);
}

#[test]
fn test_missing_library() {
    let mut symbols = HostSymbols::isolated();
    assert!(matches!(
        symbols.load_library_permanently("/nonexistent/libouttest.so"),
        Err(LoadError::NotFound { .. })
    ));
}

// ============================================================================
// Crash barrier
// ============================================================================

#[cfg(unix)]
#[test]
fn test_fault_is_contained() {
    let _serial = serial();
    let mut dispatcher = dispatcher();
    let strlen = ExternalFunction::new("strlen", vec![ValType::Ptr], Some(ValType::I64));
    let site = CallSite::new(CallSiteId(10), vec![ValType::Ptr], Some(ValType::I64));

    let mut args = [0u64, 0x10];
    assert!(!dispatcher.execute_call(&strlen, &site, &mut args).unwrap());

    // Same site again, still contained
    assert!(!dispatcher.execute_call(&strlen, &site, &mut args).unwrap());

    // The process carries on with an unrelated call
    let abs = ExternalFunction::new("abs", vec![ValType::I32], Some(ValType::I32));
    let abs_site = CallSite::new(CallSiteId(11), vec![ValType::I32], Some(ValType::I32));
    let mut args = [0u64, i32_word(-9)];
    assert!(dispatcher.execute_call(&abs, &abs_site, &mut args).unwrap());
    assert_eq!(args[0], 9);
}

// ============================================================================
// Prebound C runtime
// ============================================================================

#[cfg(unix)]
#[test]
fn test_prebound_getpid() {
    let _serial = serial();
    let config = DispatchConfig::default().with_prebind_crt(true);
    let mut dispatcher = ExternalDispatcher::with_config(config).unwrap();
    let target = ExternalFunction::new("getpid", vec![], Some(ValType::I32));
    let site = CallSite::new(CallSiteId(12), vec![], Some(ValType::I32));

    let mut args = [0u64];
    assert!(dispatcher.execute_call(&target, &site, &mut args).unwrap());
    assert_eq!(args[0] as u32, std::process::id());
    assert_eq!(dispatcher.backend().symbols().explicit_count(), 1);
}
