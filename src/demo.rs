//! The runnable demo application: a handful of exposed procedures and one
//! event, wired the way an application built on this crate would wire its
//! own. Shared between `main.rs` (serves it) and `bin/schema_gen.rs`
//! (introspects it) so both tools describe the exact same registry.
//!
//! The `echo`/`add`/`spam_me` procedures and `MyEvent` match the
//! end-to-end scenarios this runtime is tested against: a plain echo, a
//! typed-argument call that can fail validation, and a rate-limited call.
//! `login` and `greet_self` round out the story with a real credential
//! check and a login-gated call that broadcasts an event back to its own
//! caller via `Broadcaster::to`, exercising the same connection-manager
//! fan-out path a cross-user notification would take.

use std::collections::HashMap;
use std::sync::LazyLock;

use jsonwebtoken::{DecodingKey, EncodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::registry::{EphapticEvent, ExposeOptions, ParamSpec, RegistryBuilder};

const DEMO_JWT_SECRET: &[u8] = b"ephaptic-demo-secret-do-not-use-in-production";

/// Single demo account: username `alice`, password `wonderland`. A real
/// application would back this with a user table; this crate only needs
/// enough of a login story to exercise the password-hashing and
/// token-issuance path end to end.
static DEMO_USERS: LazyLock<HashMap<&'static str, String>> = LazyLock::new(|| {
    let mut users = HashMap::new();
    users.insert("alice", crate::utils::hash_password("wonderland").expect("demo password hashes"));
    users
});

#[derive(Debug, Deserialize)]
struct EchoParams {
    message: String,
}

#[derive(Debug, Deserialize)]
struct AddParams {
    a: i64,
    b: i64,
}

#[derive(Debug, Deserialize)]
struct LoginParams {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
pub struct MyEvent {
    pub message: String,
}

impl EphapticEvent for MyEvent {
    const NAME: &'static str = "MyEvent";
}

#[derive(Debug, Serialize, Deserialize)]
struct DemoClaims {
    sub: String,
}

/// Sign a demo handshake token for `user_id`. What a real login endpoint
/// would hand back to a client to use as the WebSocket `init` frame's
/// `auth` field.
pub fn issue_demo_token(user_id: &str) -> Result<String, jsonwebtoken::errors::Error> {
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &DemoClaims { sub: user_id.to_string() },
        &EncodingKey::from_secret(DEMO_JWT_SECRET),
    )
}

fn decode_demo_token(token: &str) -> Option<String> {
    jsonwebtoken::decode::<DemoClaims>(token, &DecodingKey::from_secret(DEMO_JWT_SECRET), &Validation::default())
        .ok()
        .map(|data| data.claims.sub)
}

pub fn build_registry() -> RegistryBuilder {
    let mut builder = RegistryBuilder::new();

    builder.expose(
        "echo",
        vec![ParamSpec::new::<String>("message")],
        ExposeOptions::default(),
        |p: EchoParams| async move { Ok::<_, std::convert::Infallible>(p.message) },
    );

    builder.expose(
        "add",
        vec![ParamSpec::new::<i64>("a"), ParamSpec::new::<i64>("b")],
        ExposeOptions { response_type_label: Some(std::any::type_name::<i64>()), ..Default::default() },
        |p: AddParams| async move { Ok::<_, std::convert::Infallible>(p.a + p.b) },
    );

    builder.expose(
        "login",
        vec![ParamSpec::new::<String>("username"), ParamSpec::new::<String>("password")],
        ExposeOptions::default(),
        |p: LoginParams| async move {
            let hash = DEMO_USERS.get(p.username.as_str()).ok_or_else(|| "invalid credentials".to_string())?;
            crate::utils::verify_password(&p.password, Some(hash.as_str())).map_err(|_| "invalid credentials".to_string())?;
            issue_demo_token(&p.username).map_err(|e| e.to_string())
        },
    );

    builder.expose(
        "spam_me",
        vec![],
        ExposeOptions { rate_limit: Some("1/m"), ..Default::default() },
        |_: ()| async move { Ok::<_, std::convert::Infallible>("ok".to_string()) },
    );

    builder.expose(
        "greet_self",
        vec![],
        ExposeOptions { requires_login: true, ..Default::default() },
        |_: ()| async move {
            let uid = crate::context::active_user().ok_or_else(|| "not logged in".to_string())?;
            let broadcaster = crate::context::broadcaster().expect("rpc/http scope always binds a broadcaster");
            broadcaster.to([uid.into()]).emit(&MyEvent { message: "hi".to_string() }).await;
            Ok::<_, String>(())
        },
    );

    builder.event::<MyEvent>();

    // The handshake `auth` field is expected to be a JWT issued by
    // `issue_demo_token`; anything else (including plain usernames) is
    // accepted as-is so callers can connect without a login round trip.
    builder.identity_loader(|auth| async move {
        match auth.as_str() {
            Some(token) => decode_demo_token(token).or_else(|| Some(token.to_string())),
            None => None,
        }
    });

    builder.http_identity_loader(|input| async move {
        let token = input.bearer_token?;
        decode_demo_token(&token)
    });

    builder
}
