use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error(core::ffi::c_int);

impl Error {
    #[inline]
    pub fn as_isize(self) -> isize {
        self.0 as isize
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(errno::error_info(self.as_isize()))
    }
}

pub type KResult<T = isize> = core::result::Result<T, Error>;

pub mod errno {
    macro_rules! declare_errno {
        ($($name:tt, $errno:literal, $desc:literal,)*) => {
            $(#[doc = $desc]
            pub const $name: super::Error = super::Error($errno);)*
            pub fn error_info(errno: isize) -> &'static str {
                match errno {
                    $($errno => ::core::concat!(stringify!($name), ", ", $desc),)*
                    _ => unreachable!("{}", errno),
                }
            }
        };
    }

    #[rustfmt::skip]
    declare_errno!(
        ENOENT,         -2,     "No such file or directory.",
        EIO,            -5,     "I/O error.",
        ENOMEM,         -12,    "Out of memory",
        EACCES,         -13,    "Permission denied.",
        EFAULT,         -14,    "Bad address.",
        EEXIST,         -17,    "File exists.",
        EINVAL,         -22,    "Invalid argument.",
    );
}
