//! Remote policy repository sync
//!
//! The grant set may live in a git repository. The first refresh clones it
//! into the working directory; later refreshes fetch and fast-forward the
//! configured reference. Landing on an already-up-to-date tip is success.

use std::path::PathBuf;

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{Cred, FetchOptions, RemoteCallbacks, Repository};
use tracing::{debug, info};

/// A remote policy repository
#[derive(Debug, Clone)]
pub struct RemoteRepo {
    /// Clone/fetch URL
    pub url: String,
    /// Local working directory the repository is synced into
    pub clone_dir: PathBuf,
    /// Reference to track, either `refs/heads/<branch>` or a bare branch name
    pub reference: String,
    /// Credential for the remote (sent as userpass with a fixed username)
    pub token: Option<String>,
}

impl RemoteRepo {
    fn branch(&self) -> &str {
        self.reference
            .strip_prefix("refs/heads/")
            .unwrap_or(&self.reference)
    }

    fn refname(&self) -> String {
        format!("refs/heads/{}", self.branch())
    }
}

/// Sync the working directory to the remote's configured reference
pub fn sync(repo: &RemoteRepo) -> Result<(), git2::Error> {
    if repo.clone_dir.join(".git").exists() {
        pull(repo)
    } else {
        clone(repo)
    }
}

fn auth_callbacks(token: Option<String>) -> RemoteCallbacks<'static> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, _allowed_types| {
        match &token {
            Some(token) => Cred::userpass_plaintext("devops", token),
            None => Cred::username(username_from_url.unwrap_or("git")),
        }
    });
    callbacks
}

fn fetch_options(token: Option<String>) -> FetchOptions<'static> {
    let mut options = FetchOptions::new();
    options.remote_callbacks(auth_callbacks(token));
    options
}

fn clone(repo: &RemoteRepo) -> Result<(), git2::Error> {
    info!(url = %repo.url, dir = %repo.clone_dir.display(), "cloning policy repository");

    let mut builder = RepoBuilder::new();
    builder.branch(repo.branch());
    builder.fetch_options(fetch_options(repo.token.clone()));
    let cloned = builder.clone(&repo.url, &repo.clone_dir)?;

    log_head(&cloned)?;
    Ok(())
}

fn pull(repo: &RemoteRepo) -> Result<(), git2::Error> {
    debug!(url = %repo.url, reference = %repo.reference, "fetching policy repository");

    let local = Repository::open(&repo.clone_dir)?;
    {
        let mut remote = local.find_remote("origin")?;
        remote.fetch(
            &[repo.refname().as_str()],
            Some(&mut fetch_options(repo.token.clone())),
            None,
        )?;
    }

    let fetch_head = local.find_reference("FETCH_HEAD")?;
    let fetched = local.reference_to_annotated_commit(&fetch_head)?;
    let (analysis, _) = local.merge_analysis(&[&fetched])?;

    if analysis.is_up_to_date() {
        debug!("policy repository already up to date");
    } else if analysis.is_fast_forward() {
        fast_forward(&local, &repo.refname(), fetched.id())?;
    } else {
        return Err(git2::Error::from_str(
            "remote policy reference diverged from local clone; refusing non-fast-forward",
        ));
    }

    log_head(&local)?;
    Ok(())
}

fn fast_forward(repo: &Repository, refname: &str, target: git2::Oid) -> Result<(), git2::Error> {
    match repo.find_reference(refname) {
        Ok(mut reference) => {
            reference.set_target(target, "policy sync fast-forward")?;
        }
        Err(_) => {
            repo.reference(refname, target, true, "policy sync fast-forward")?;
        }
    }
    repo.set_head(refname)?;
    repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
    Ok(())
}

fn log_head(repo: &Repository) -> Result<(), git2::Error> {
    let commit = repo.head()?.peel_to_commit()?;
    info!(commit = %commit.id(), "policy repository synced");
    Ok(())
}
