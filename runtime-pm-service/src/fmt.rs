//! Logging macros
//!
//! `trace!` through `error!` forward to `defmt` or `log` depending on the enabled feature. With neither feature the
//! arguments are still evaluated by reference so that call sites type-check the same way in every configuration.

#[cfg(all(feature = "log", feature = "defmt", target_os = "none", not(doc)))]
compile_error!("features `log` and `defmt` are mutually exclusive on no_std targets");

#[cfg(all(not(doc), feature = "defmt", feature = "log", not(target_os = "none")))]
mod backend {
    /// Emit a record to both defmt and log
    #[doc(hidden)]
    #[macro_export]
    #[collapse_debuginfo(yes)]
    macro_rules! __pm_emit {
        ($level:ident, $s:literal $(, $x:expr)*) => {{
            let _ = ($s $(, &$x )*);
            ::defmt::$level!($s $(, $x)*);
            ::log::$level!($s $(, $x)*);
        }};
    }
}

#[cfg(all(not(doc), feature = "defmt", not(all(feature = "log", not(target_os = "none")))))]
mod backend {
    /// Emit a record to defmt
    #[doc(hidden)]
    #[macro_export]
    #[collapse_debuginfo(yes)]
    macro_rules! __pm_emit {
        ($level:ident, $s:literal $(, $x:expr)*) => {{
            let _ = ($s $(, &$x )*);
            ::defmt::$level!($s $(, $x)*);
        }};
    }
}

#[cfg(all(not(doc), feature = "log", not(feature = "defmt")))]
mod backend {
    /// Emit a record to log
    #[doc(hidden)]
    #[macro_export]
    #[collapse_debuginfo(yes)]
    macro_rules! __pm_emit {
        ($level:ident, $s:literal $(, $x:expr)*) => {{
            ::log::$level!($s $(, $x)*);
        }};
    }
}

#[cfg(any(doc, not(any(feature = "defmt", feature = "log"))))]
mod backend {
    /// Discard the record
    #[doc(hidden)]
    #[macro_export]
    #[collapse_debuginfo(yes)]
    macro_rules! __pm_emit {
        ($level:ident, $s:literal $(, $x:expr)*) => {{
            let _ = ($s $(, &$x )*);
        }};
    }
}

/// Logs a trace message
#[macro_export]
#[collapse_debuginfo(yes)]
macro_rules! trace {
    ($s:literal $(, $x:expr)* $(,)?) => {
        $crate::__pm_emit!(trace, $s $(, $x)*)
    };
}

/// Logs a debug message
#[macro_export]
#[collapse_debuginfo(yes)]
macro_rules! debug {
    ($s:literal $(, $x:expr)* $(,)?) => {
        $crate::__pm_emit!(debug, $s $(, $x)*)
    };
}

/// Logs an info message
#[macro_export]
#[collapse_debuginfo(yes)]
macro_rules! info {
    ($s:literal $(, $x:expr)* $(,)?) => {
        $crate::__pm_emit!(info, $s $(, $x)*)
    };
}

/// Logs a warning
#[macro_export]
#[collapse_debuginfo(yes)]
macro_rules! warn {
    ($s:literal $(, $x:expr)* $(,)?) => {
        $crate::__pm_emit!(warn, $s $(, $x)*)
    };
}

/// Logs an error
#[macro_export]
#[collapse_debuginfo(yes)]
macro_rules! error {
    ($s:literal $(, $x:expr)* $(,)?) => {
        $crate::__pm_emit!(error, $s $(, $x)*)
    };
}
