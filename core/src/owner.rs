use std::collections::HashMap;

type Resolver = fn(u32) -> Option<String>;

/// uid/gid to name lookups for the metadata reader. Each id is resolved at
/// most once until `clear` is called.
#[derive(Debug)]
pub struct OwnerCache {
    resolve_user: Resolver,
    resolve_group: Resolver,
    users: HashMap<u32, Option<String>>,
    groups: HashMap<u32, Option<String>>,
}

impl Default for OwnerCache {
    fn default() -> Self {
        Self::with_resolvers(system_user, system_group)
    }
}

impl OwnerCache {
    /// Names come from the system user database (getpwuid/getgrgid), so NSS
    /// sources such as LDAP are honoured.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolvers(resolve_user: Resolver, resolve_group: Resolver) -> Self {
        Self {
            resolve_user,
            resolve_group,
            users: HashMap::new(),
            groups: HashMap::new(),
        }
    }

    pub fn username(&mut self, uid: u32) -> Option<String> {
        let resolve = self.resolve_user;
        self.users.entry(uid).or_insert_with(|| resolve(uid)).clone()
    }

    pub fn groupname(&mut self, gid: u32) -> Option<String> {
        let resolve = self.resolve_group;
        self.groups.entry(gid).or_insert_with(|| resolve(gid)).clone()
    }

    pub fn clear(&mut self) {
        self.users.clear();
        self.groups.clear();
    }
}

#[cfg(unix)]
fn system_user(uid: u32) -> Option<String> {
    use nix::unistd::{Uid, User};
    User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|u| u.name)
}

#[cfg(unix)]
fn system_group(gid: u32) -> Option<String> {
    use nix::unistd::{Gid, Group};
    Group::from_gid(Gid::from_raw(gid)).ok().flatten().map(|g| g.name)
}

#[cfg(not(unix))]
fn system_user(_uid: u32) -> Option<String> {
    None
}

#[cfg(not(unix))]
fn system_group(_gid: u32) -> Option<String> {
    None
}
