pub mod frame;
pub mod node;

/*
    Transport itself (sockets, TLS, session handling) lives outside this
    crate. What is here is the byte layout a request takes on the wire and
    the per-server identity that signs what arrives in it.
*/
