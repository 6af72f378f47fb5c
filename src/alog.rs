//! Allocator logging. Everything here is a no-op until [`crate::enable_logging`] is called.

macro_rules! alog {
    ($level:ident, $($arg:tt)*) => {
        if $crate::should_log() {
            ::log::$level!(target: "bfalloc", $($arg)*);
        }
    };
}

macro_rules! aerror {
    ($($arg:tt)*) => {
        alog!(error, $($arg)*)
    };
}

macro_rules! awarn {
    ($($arg:tt)*) => {
        alog!(warn, $($arg)*)
    };
}

macro_rules! ainfo {
    ($($arg:tt)*) => {
        alog!(info, $($arg)*)
    };
}

macro_rules! adebug {
    ($($arg:tt)*) => {
        alog!(debug, $($arg)*)
    };
}

macro_rules! atrace {
    ($($arg:tt)*) => {
        alog!(trace, $($arg)*)
    };
}
