use pkg_state::Client;
use pkg_types::meta::Resource;
use pkg_types::selector::LabelSelector;
use tracing::{debug, info};

/// Candidates split by what claiming them means for one owner.
#[derive(Debug)]
pub struct Claims<R> {
    /// Controlled by the owner and still matching.
    pub owned: Vec<R>,
    /// Matching orphans the owner should take over.
    pub adopt: Vec<R>,
    /// Controlled by the owner but no longer matching.
    pub release: Vec<R>,
}

/// Sort `candidates` by the controller-ref rules. Objects controlled by
/// someone else, and orphans that do not match, are dropped.
pub fn classify<R: Resource>(
    candidates: Vec<R>,
    selector: &LabelSelector,
    owner_uid: &str,
    owner_deleting: bool,
) -> Claims<R> {
    let mut claims = Claims {
        owned: Vec::new(),
        adopt: Vec::new(),
        release: Vec::new(),
    };

    for object in candidates {
        let meta = object.metadata();
        let matches = selector.matches(&meta.labels);
        let deleting = meta.is_deleting();
        let controller = meta.controller_ref().map(|r| r.uid.clone());
        match controller.as_deref() {
            Some(uid) if uid == owner_uid => {
                if matches {
                    claims.owned.push(object);
                } else if !owner_deleting {
                    claims.release.push(object);
                }
            }
            Some(_) => {}
            None => {
                if matches && !owner_deleting && !deleting {
                    claims.adopt.push(object);
                }
            }
        }
    }
    claims
}

/// Claims objects for one owner: adopts matching orphans and releases
/// owned objects that stopped matching.
pub struct ClaimManager<'a, O: Resource> {
    client: &'a Client,
    owner: &'a O,
    selector: &'a LabelSelector,
}

impl<'a, O: Resource> ClaimManager<'a, O> {
    pub fn new(client: &'a Client, owner: &'a O, selector: &'a LabelSelector) -> Self {
        Self {
            client,
            owner,
            selector,
        }
    }

    /// The subset of `candidates` owned by the owner once adoptions and
    /// releases are persisted.
    pub async fn claim<R: Resource>(&self, candidates: Vec<R>) -> anyhow::Result<Vec<R>> {
        let owner_meta = self.owner.metadata();
        let claims = classify(
            candidates,
            self.selector,
            &owner_meta.uid,
            owner_meta.is_deleting(),
        );
        let mut owned = claims.owned;

        if !claims.adopt.is_empty() {
            self.check_can_adopt().await?;
        }

        for mut object in claims.adopt {
            object
                .metadata_mut()
                .set_controller_ref(self.owner.controller_owner_ref())?;
            match self.client.update(&object).await {
                Ok(adopted) => {
                    info!(
                        "{} {}: adopted {} {}",
                        O::KIND,
                        owner_meta.key(),
                        R::KIND,
                        adopted.metadata().key()
                    );
                    owned.push(adopted);
                }
                Err(e) if e.is_not_found() => {
                    debug!("{} {} vanished before adoption", R::KIND, object.name());
                }
                Err(e) => return Err(e.into()),
            }
        }

        for mut object in claims.release {
            object.metadata_mut().remove_owner_ref(&owner_meta.uid);
            match self.client.update(&object).await {
                Ok(released) => info!(
                    "{} {}: released {} {}",
                    O::KIND,
                    owner_meta.key(),
                    R::KIND,
                    released.metadata().key()
                ),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(owned)
    }

    /// Re-read the owner; adoption is refused once it was recreated or is
    /// going away.
    async fn check_can_adopt(&self) -> anyhow::Result<()> {
        let meta = self.owner.metadata();
        let fresh: O = self.client.get(&meta.namespace, &meta.name).await?;
        if fresh.uid() != meta.uid {
            anyhow::bail!(
                "original {} {} is gone: got uid {}, wanted {}",
                O::KIND,
                meta.key(),
                fresh.uid(),
                meta.uid
            );
        }
        if fresh.metadata().is_deleting() {
            anyhow::bail!(
                "{} {} has just been deleted at {:?}",
                O::KIND,
                meta.key(),
                fresh.metadata().deletion_timestamp
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use pkg_types::deployment::Deployment;
    use pkg_types::meta::ObjectMeta;

    fn deployment(name: &str, app: &str) -> Deployment {
        let mut d = Deployment::default();
        d.metadata = ObjectMeta::new("default", name);
        d.metadata.labels.insert("app".to_string(), app.to_string());
        d
    }

    #[test]
    fn classify_follows_controller_refs() {
        let selector = LabelSelector::from_labels([("app", "web")]);
        let owner = testing::owner_ref("owner-uid");
        let other = testing::owner_ref("other-uid");

        let mut owned = deployment("owned", "web");
        owned.metadata.set_controller_ref(owner.clone()).unwrap();
        let mut stale = deployment("stale", "api");
        stale.metadata.set_controller_ref(owner).unwrap();
        let mut foreign = deployment("foreign", "web");
        foreign.metadata.set_controller_ref(other).unwrap();
        let orphan = deployment("orphan", "web");
        let stranger = deployment("stranger", "api");

        let claims = classify(
            vec![owned, stale, foreign, orphan, stranger],
            &selector,
            "owner-uid",
            false,
        );
        let names = |v: &[Deployment]| v.iter().map(|d| d.metadata.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&claims.owned), vec!["owned"]);
        assert_eq!(names(&claims.release), vec!["stale"]);
        assert_eq!(names(&claims.adopt), vec!["orphan"]);
    }

    #[test]
    fn deleting_owner_adopts_and_releases_nothing() {
        let selector = LabelSelector::from_labels([("app", "web")]);
        let mut stale = deployment("stale", "api");
        stale
            .metadata
            .set_controller_ref(testing::owner_ref("owner-uid"))
            .unwrap();
        let claims = classify(
            vec![stale, deployment("orphan", "web")],
            &selector,
            "owner-uid",
            true,
        );
        assert!(claims.owned.is_empty());
        assert!(claims.adopt.is_empty());
        assert!(claims.release.is_empty());
    }

    #[tokio::test]
    async fn claim_persists_adoption_and_release() {
        let client = testing::client();
        let ud = testing::create_united(&client, testing::deployment_united("web")).await;

        let orphan = client.create(&deployment("orphan", "web")).await.unwrap();
        let mut stale = deployment("stale", "api");
        stale
            .metadata
            .set_controller_ref(ud.controller_owner_ref())
            .unwrap();
        let stale = client.create(&stale).await.unwrap();

        let manager = ClaimManager::new(&client, &ud, &ud.spec.selector);
        let owned = manager.claim(vec![orphan, stale]).await.unwrap();
        assert_eq!(owned.len(), 1);
        assert!(owned[0].metadata.is_controlled_by(ud.uid()));

        let stored: Deployment = client.get("default", "orphan").await.unwrap();
        assert!(stored.metadata.is_controlled_by(ud.uid()));
        let stored: Deployment = client.get("default", "stale").await.unwrap();
        assert!(stored.metadata.controller_ref().is_none());
    }

    #[tokio::test]
    async fn adoption_refused_for_recreated_owner() {
        let client = testing::client();
        let mut ud = testing::create_united(&client, testing::deployment_united("web")).await;
        ud.metadata.uid = "stale-uid".to_string();

        let orphan = client.create(&deployment("orphan", "web")).await.unwrap();
        let manager = ClaimManager::new(&client, &ud, &ud.spec.selector);
        assert!(manager.claim(vec![orphan]).await.is_err());
    }
}
