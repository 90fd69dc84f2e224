use anyhow::{Result, anyhow};
use clap::Args;
use strata_core::forget::{ForgetPlan, Selection, forget_selected};
use strata_core::{Repository, RetentionPolicy};

use super::Context;

#[derive(Args)]
pub struct ForgetCommand {
    #[arg(help = "Generations to remove, by number or \"latest\" (default: apply the policy)")]
    generations: Vec<String>,

    #[arg(short = 'c', long = "client", help = "Client to act on, may be repeated (default: all)")]
    clients: Vec<String>,

    #[arg(long, help = "Retention rules, e.g. \"24h,7d,4w,12m,2y\"")]
    keep: Option<String>,

    #[arg(long, help = "Keep last N generations")]
    keep_last: Option<usize>,

    #[arg(long, help = "Only show what would be removed")]
    dry_run: bool,
}

impl ForgetCommand {
    fn policy(&self, ctx: &Context) -> Result<RetentionPolicy> {
        let rules = self.keep.clone().or_else(|| ctx.config.keep.clone());
        let mut policy: RetentionPolicy = match rules {
            Some(rules) => rules.parse()?,
            None => RetentionPolicy::default(),
        };
        if let Some(n) = self.keep_last {
            policy = policy.with_keep_last(n);
        }
        if policy.is_empty() {
            return Err(anyhow!("A retention policy is required (--keep or --keep-last)"));
        }
        Ok(policy)
    }

    pub async fn run(&self, ctx: &Context) -> Result<()> {
        if !self.generations.is_empty() {
            if self.keep.is_some() || self.keep_last.is_some() {
                return Err(anyhow!("Named generations cannot be combined with --keep or --keep-last"));
            }
            let client = match self.clients.as_slice() {
                [] => ctx.client(None)?,
                [one] => one.clone(),
                _ => return Err(anyhow!("Named generations belong to exactly one client")),
            };
            let mut repo = ctx.open().await?;
            let selection = Selection::Generations(&self.generations);
            let plan = forget_selected(&mut repo, &client, selection, self.dry_run).await?;
            self.report(&repo, &client, &plan);
            return Ok(());
        }

        let policy = self.policy(ctx)?;
        let mut repo = ctx.open().await?;
        let clients = if self.clients.is_empty() {
            repo.get_client_names().await?
        } else {
            self.clients.clone()
        };
        for client in clients {
            let plan = forget_selected(&mut repo, &client, Selection::Policy(&policy), self.dry_run).await?;
            self.report(&repo, &client, &plan);
        }
        Ok(())
    }

    fn report(&self, repo: &Repository, client: &str, plan: &ForgetPlan) {
        let verb = if self.dry_run { "would remove" } else { "removed" };
        println!(
            "{client}: keeping {}, {verb} {}",
            plan.keep.len(),
            plan.remove.len()
        );
        for gen_id in &plan.remove {
            println!("  {verb} generation {}", repo.make_generation_spec(gen_id));
        }
    }
}
