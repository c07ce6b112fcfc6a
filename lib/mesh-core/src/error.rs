use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Peer {identifier} does not advertise a usable {attribute} port")]
    MissingAttribute {
        identifier: String,
        attribute: &'static str,
    },

    #[error("Invalid service definition: {0}")]
    InvalidDefinition(String),
}
