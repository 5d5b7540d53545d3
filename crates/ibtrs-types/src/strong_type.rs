/// Newtype over an integer id, so ids of different kinds cannot be mixed.
///
/// The field stays public: ids are built from wire values and read back
/// with `.0`. `Debug` prints the type name, `Display` only the number.
#[macro_export]
macro_rules! strong_type {
    ($name:ident, $inner:ty) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $name(pub $inner);

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    strong_type!(SlotNo, u16);

    #[test]
    fn test_display_and_debug() {
        let no = SlotNo(3);
        assert_eq!(format!("{}", no), "3");
        assert_eq!(format!("{:?}", no), "SlotNo(3)");
        assert_eq!(no, SlotNo(3));
        assert_ne!(no, SlotNo(4));
    }
}
