use cluster::config::Settings;
use cluster::lifecycle::images;
use cluster::out::Icon;
use structopt::StructOpt;

#[derive(StructOpt, Clone, Debug)]
pub enum Image {
    /// Loads images into minikube, from the host's cache or from tarballs
    Load {
        #[structopt(required = true)]
        images: Vec<String>,
    },
    /// Removes one or more images
    Rm {
        #[structopt(required = true)]
        images: Vec<String>,
    },
    /// Lists images
    Ls,
}

impl Image {
    pub async fn run(&self, settings: &Settings) -> anyhow::Result<i32> {
        match self {
            Image::Load { images: refs } => images::load(settings, refs).await?,
            Image::Rm { images: refs } => images::remove(settings, refs).await?,
            Image::Ls => {
                let mut text = String::new();
                for image in images::list(settings).await? {
                    text.push_str(&image);
                    text.push('\n');
                }
                settings.out().raw(&text);
            }
        }
        Ok(0)
    }
}

#[derive(StructOpt, Clone, Debug)]
pub enum Cache {
    /// Adds images to the local cache
    Add {
        #[structopt(required = true)]
        images: Vec<String>,
    },
    /// Deletes images from the local cache
    Delete {
        #[structopt(required = true)]
        images: Vec<String>,
    },
    /// Lists the images in the local cache
    List,
    /// Reloads the cached images into every running profile
    Reload,
}

impl Cache {
    pub async fn run(&self, settings: &Settings) -> anyhow::Result<i32> {
        let out = settings.out();
        match self {
            Cache::Add { images: refs } => {
                images::cache_add(settings, refs).await?;
            }
            Cache::Delete { images: refs } => {
                images::cache_delete(settings, refs).await?;
            }
            Cache::List => {
                let mut text = String::new();
                for image in images::cache_list(settings).await? {
                    text.push_str(&image);
                    text.push('\n');
                }
                out.raw(&text);
            }
            Cache::Reload => {
                let reloaded = images::cache_reload(settings).await?;
                out.step(Icon::Check, format!("Reloaded cached images into {} profile(s)", reloaded));
            }
        }
        Ok(0)
    }
}
