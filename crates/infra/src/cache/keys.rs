//! Cache key convention.
//!
//! Response caches are keyed `response:<audience>:<resource family>:<segment>`, where the
//! audience is `customer:<actor id>`, `admin` or `public`. Invalidation deletes by glob over
//! a family, e.g. `response:customer:<id>:*support-tickets*`.

use backoffice_core::ActorId;

/// Who a cached response was rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Customer(ActorId),
    Admin,
    Public,
}

impl Audience {
    fn prefix(&self) -> String {
        match self {
            Audience::Customer(id) => format!("response:customer:{id}"),
            Audience::Admin => "response:admin".to_string(),
            Audience::Public => "response:public".to_string(),
        }
    }
}

pub fn response_key(audience: Audience, family: &str, segment: &str) -> String {
    format!("{}:{family}:{segment}", audience.prefix())
}

/// Glob matching every cached response of `family` for `audience`.
pub fn family_pattern(audience: Audience, family: &str) -> String {
    format!("{}:*{family}*", audience.prefix())
}

/// Redis-style glob match supporting `*`, `?` and `\` escapes.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();
    let (mut pi, mut ki) = (0, 0);
    // Last `*` seen and the key position it is currently absorbing up to.
    let mut star: Option<(usize, usize)> = None;

    while ki < k.len() {
        match p.get(pi) {
            Some('*') => {
                star = Some((pi, ki));
                pi += 1;
                continue;
            }
            Some('?') => {
                pi += 1;
                ki += 1;
                continue;
            }
            Some('\\') if p.get(pi + 1) == Some(&k[ki]) => {
                pi += 2;
                ki += 1;
                continue;
            }
            Some(c) if *c != '\\' && *c == k[ki] => {
                pi += 1;
                ki += 1;
                continue;
            }
            _ => {}
        }
        match star {
            Some((sp, sk)) => {
                star = Some((sp, sk + 1));
                pi = sp + 1;
                ki = sk + 1;
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}
