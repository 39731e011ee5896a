/// Types implementing Serialisable can be written to the client side of a
/// broker connection.
pub trait Serialisable {
    /// Converts the value in question to its wire representation.
    fn serialise(&self) -> Vec<u8>;
}
