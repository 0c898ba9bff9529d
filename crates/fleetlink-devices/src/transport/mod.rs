/*!
 * The three device transports families are composed from.
 */

pub mod framed;
pub mod http;
pub mod shell;
pub mod ssh;

pub use framed::FramedTransport;
pub use http::{ApiBody, ApiRequest, ApiResponse, Authenticator, Credential, HttpSession, HttpTransport, StaticAuth};
pub use shell::{ShellDialer, ShellMode, ShellTarget, ShellTransport};
pub use ssh::RusshDialer;
