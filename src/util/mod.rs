use std::ops::{Div, Rem};

use zerocopy::FromZeroes;

pub(crate) mod read;

#[inline(always)]
pub(crate) fn div_rem<T>(x: T, y: T) -> (T, T)
where T: Div<Output = T> + Rem<Output = T> + Copy {
    let quot = x / y;
    let rem = x % y;
    (quot, rem)
}

/// Heap-allocates a zeroed fixed-size array. Goes through a boxed slice so
/// the array is never staged on the stack, which matters for multi-MiB
/// buffers in unoptimized builds.
#[inline]
pub(crate) fn zeroed_box<T: FromZeroes, const N: usize>() -> Box<[T; N]> {
    T::new_box_slice_zeroed(N).try_into().ok().unwrap() // Safe: length is N
}

/// Creates a fixed-size array reference from a slice.
#[macro_export]
macro_rules! array_ref {
    ($slice:expr, $offset:expr, $size:expr) => {{
        #[inline(always)]
        fn to_array<T>(slice: &[T]) -> &[T; $size] {
            unsafe { &*(slice.as_ptr() as *const [_; $size]) }
        }
        to_array(&$slice[$offset..$offset + $size])
    }};
}

/// Compile-time assertion.
#[macro_export]
macro_rules! static_assert {
    ($condition:expr) => {
        const _: () = core::assert!($condition);
    };
}
