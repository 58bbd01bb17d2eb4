use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("could not set up logging: {_0}")]
    Logging(#[error(not(source))] String),
    #[display("could not initialize storage")]
    Storage,
    #[display("could not listen on port {_0}")]
    Bind(#[error(not(source))] u16),
    #[display("server stopped unexpectedly")]
    Serve,
}
