use nix::unistd::{Gid, Group, Uid, User};

/// A filesystem directory archived verbatim.
#[derive(Clone, Debug)]
pub struct Directory {
    pub name: String,
    pub user: Option<String>,
    pub group: Option<String>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            user: None,
            group: None,
        }
    }

    pub fn get_gid(&self) -> Option<Gid> {
        let group = self.group.as_ref()?;
        match Group::from_name(group.as_str()) {
            Ok(group_opt) => group_opt.map(|group| group.gid),
            Err(_) => None,
        }
    }

    pub fn get_uid(&self) -> Option<Uid> {
        let user = self.user.as_ref()?;
        match User::from_name(user.as_str()) {
            Ok(user_opt) => user_opt.map(|user| user.uid),
            Err(_) => None,
        }
    }
}
