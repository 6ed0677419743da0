//! Internal diagnostics.
//!
//! `os_log!(level, ...)` forwards to `defmt` when the `defmt` feature is
//! enabled. Otherwise the arguments are only type-checked, so the call
//! compiles to nothing and values used only for logging do not trigger
//! unused warnings. Format strings stick to plain `{}` so both paths accept
//! them; every logged type implements both `Display` and `defmt::Format`.

#[cfg(feature = "defmt")]
macro_rules! os_log {
    ($level:ident, $($arg:tt)+) => {
        ::defmt::$level!($($arg)+)
    };
}

#[cfg(not(feature = "defmt"))]
macro_rules! os_log {
    ($level:ident, $($arg:tt)+) => {
        if false {
            let _ = ::core::format_args!($($arg)+);
        }
    };
}

/// `LWIP_ASSERT` for void-returning sys_arch calls: log, then trip in debug builds.
macro_rules! lwip_assert {
    ($cond:expr, $msg:literal $(, $arg:expr)*) => {
        if !$cond {
            os_log!(error, $msg $(, $arg)*);
            debug_assert!(false, $msg $(, $arg)*);
        }
    };
}
