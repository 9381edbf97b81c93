mod sealed {
    pub trait Sealed {}
}

/// A value usable as a cache key. Only string and integer ids qualify.
pub trait CacheKey: sealed::Sealed {
    fn to_key(&self) -> String;
}

impl sealed::Sealed for String {}
impl CacheKey for String {
    fn to_key(&self) -> String {
        self.clone()
    }
}

impl sealed::Sealed for &str {}
impl CacheKey for &str {
    fn to_key(&self) -> String {
        (*self).to_string()
    }
}

impl sealed::Sealed for &String {}
impl CacheKey for &String {
    fn to_key(&self) -> String {
        (*self).clone()
    }
}

macro_rules! int_cache_key {
    ($($t:ty),*) => {
        $(
            impl sealed::Sealed for $t {}
            impl CacheKey for $t {
                fn to_key(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

int_cache_key!(i32, i64, u32, u64, usize);
