//! Helpers used to define identifier types that are backed by integers,
//! without letting one kind of identifier be passed where another is expected.
//!
//! # Example
//!
//! ```ignore
//! // An opaque `FlagId` backed by a `u32`.
//! int_like!(FlagId, u32);
//!
//! // `UnitId` plus `AtomicUnitId`, backed by `u32` and `AtomicU32`.
//! int_like!(UnitId, AtomicUnitId, u32, AtomicU32);
//! ```

#[macro_export]
macro_rules! int_like {
    ($new_type_name:ident, $backing_type:ident) => {
        #[derive(Default, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
        pub struct $new_type_name($backing_type);

        impl $new_type_name {
            #[allow(dead_code)]
            #[inline]
            pub const fn get(self) -> $backing_type {
                self.0
            }
            #[allow(dead_code)]
            #[inline]
            pub const fn new(x: $backing_type) -> Self {
                $new_type_name(x)
            }
        }

        impl ::core::fmt::Debug for $new_type_name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                write!(f, concat!(stringify!($new_type_name), "({:#x})"), self.0)
            }
        }

        impl ::core::fmt::Display for $new_type_name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl ::core::convert::From<$backing_type> for $new_type_name {
            #[inline]
            fn from(inner: $backing_type) -> Self {
                Self::new(inner)
            }
        }
        impl ::core::convert::From<$new_type_name> for $backing_type {
            #[inline]
            fn from(wrapped: $new_type_name) -> Self {
                wrapped.get()
            }
        }
    };

    ($new_type_name:ident, $new_atomic_type_name:ident, $backing_type:ident, $backing_atomic_type:ident) => {
        int_like!($new_type_name, $backing_type);

        /// Allocator for fresh identifiers, shareable among threads.
        pub struct $new_atomic_type_name {
            container: ::core::sync::atomic::$backing_atomic_type,
        }

        impl $new_atomic_type_name {
            #[allow(dead_code)]
            #[inline]
            pub const fn new(x: $new_type_name) -> Self {
                $new_atomic_type_name {
                    container: ::core::sync::atomic::$backing_atomic_type::new(x.get()),
                }
            }
            #[allow(dead_code)]
            #[inline]
            pub fn load(&self, order: ::core::sync::atomic::Ordering) -> $new_type_name {
                $new_type_name::from(self.container.load(order))
            }
            /// Hands out the current value and advances the counter.
            #[allow(dead_code)]
            #[inline]
            pub fn next(&self) -> $new_type_name {
                $new_type_name::from(
                    self.container
                        .fetch_add(1, ::core::sync::atomic::Ordering::Relaxed),
                )
            }
        }
        impl ::core::default::Default for $new_atomic_type_name {
            #[inline]
            fn default() -> Self {
                Self::new($new_type_name::new(0))
            }
        }
    };
}

#[test]
fn test() {
    use core::mem::size_of;

    int_like!(U32Like, u32);
    assert_eq!(size_of::<U32Like>(), size_of::<u32>());

    int_like!(U32Like2, AtomicU32Like, u32, AtomicU32);
    assert_eq!(size_of::<U32Like2>(), size_of::<u32>());

    let counter = AtomicU32Like::new(U32Like2::new(7));
    assert_eq!(counter.next(), U32Like2::new(7));
    assert_eq!(counter.next(), U32Like2::new(8));
    assert_eq!(
        counter.load(::core::sync::atomic::Ordering::Relaxed),
        U32Like2::new(9)
    );
    assert_eq!(u32::from(U32Like::from(3)), 3);
}
